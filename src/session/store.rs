use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// The single live binding of an account to a client identity.
///
/// Encoded as JSON in the backing store. The `identity` field name is part of
/// the stored format: the Redis compare-and-set script reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub account_id: Uuid,
    pub identity: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn encode(&self) -> Result<String, DatabaseError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, DatabaseError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Key-value storage with per-key expiry and a conditional write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the live record under `key`. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Atomically writes `record` with `ttl` if the current live entry matches
    /// `expected_identity`: `None` means "no live entry", `Some(id)` means "a
    /// live entry bound to `id`". Returns whether the write happened.
    async fn conditional_set(
        &self,
        key: &str,
        expected_identity: Option<&str>,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;
}
