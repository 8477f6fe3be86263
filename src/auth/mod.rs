//! Authentication module
//!
//! Registration and login, identity tokens, and the request-rate gate in
//! front of both. Session binding lives in `crate::session`.

pub mod handlers;
pub mod password;
mod rate_limit;
mod service;
pub mod token;

pub use service::{AuthOptions, AuthService};
pub use rate_limit::{RateLimiter, RateLimitConfig};
pub use token::{Claims, JwtIssuer, TokenIssuer};
