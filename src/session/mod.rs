//! Single-active-session bookkeeping.
//!
//! Each account has at most one live `SessionRecord` (identity + token). A
//! later bind from the same identity replaces it, a bind from any other
//! identity is refused until the record expires.

pub mod memory;
pub mod redis;
pub mod registry;
pub mod store;

pub use memory::MemorySessionStore;
pub use self::redis::RedisSessionStore;
pub use registry::{session_key, BindOutcome, SessionRegistry};
pub use store::{SessionRecord, SessionStore};
