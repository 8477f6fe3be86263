//! Account persistence.
//!
//! `CredentialStore` is the seam the auth service talks to; `DbOperations`
//! backs it with Postgres and `MemoryCredentialStore` keeps it in process.

pub mod memory;
pub mod models;
pub mod operations;

pub use memory::MemoryCredentialStore;
pub use models::Account;
pub use operations::{CredentialStore, DbOperations};
