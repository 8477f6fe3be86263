//! bcrypt password hashing, run on the blocking pool so request workers stay free.

use tracing::warn;

use crate::error::AuthError;

/// Cost bounds accepted by bcrypt.
pub const MIN_BCRYPT_COST: u32 = 4;
pub const MAX_BCRYPT_COST: u32 = 31;

pub async fn hash_password(plain: &str, cost: u32) -> Result<String, AuthError> {
    let plain = plain.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::hash(plain, cost))
        .await
        .map_err(|e| AuthError::Infrastructure(format!("hashing task failed: {}", e)))?
        .map_err(|e| AuthError::Infrastructure(format!("password hashing failed: {}", e)))
}

/// Constant-time check of `plain` against a stored bcrypt hash.
/// A malformed stored hash counts as a mismatch.
pub async fn verify_password(plain: &str, hash: &str) -> Result<bool, AuthError> {
    let plain = plain.to_owned();
    let hash = hash.to_owned();
    let outcome = tokio::task::spawn_blocking(move || bcrypt::verify(plain, &hash))
        .await
        .map_err(|e| AuthError::Infrastructure(format!("verification task failed: {}", e)))?;

    match outcome {
        Ok(matches) => Ok(matches),
        Err(e) => {
            warn!("Stored password hash could not be parsed: {}", e);
            Ok(false)
        }
    }
}
