use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::session::store::{SessionRecord, SessionStore};

pub fn session_key(account_id: Uuid) -> String {
    format!("auth:user:{}", account_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Accepted,
    /// Another identity holds an unexpired session. Nothing was written.
    Conflict { holder: String },
}

/// Maps each account to its single bound session.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// The unexpired session for `account_id`, if any.
    pub async fn current(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let record = self.store.get(&session_key(account_id)).await?;
        Ok(record.filter(|record| !record.is_expired(now)))
    }

    /// Binds `token` for `identity` unless a different identity holds a live session.
    ///
    /// The decision is enforced by the store's conditional write on the
    /// identity that was read, so a concurrent bind between the read and the
    /// write makes the write fail instead of overwriting. A lost write is
    /// re-read: another live identity means conflict, the caller's own
    /// identity (a duplicate submit from the same client) gets one more
    /// write against that binding.
    pub async fn bind(
        &self,
        account_id: Uuid,
        identity: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<BindOutcome, DatabaseError> {
        let key = session_key(account_id);
        let record = SessionRecord {
            account_id,
            identity: identity.to_string(),
            token: token.to_string(),
            expires_at: now + self.ttl,
        };

        let existing = self.store.get(&key).await?;
        if let Some(holder) = Self::foreign_holder(existing.as_ref(), identity, now) {
            return Ok(BindOutcome::Conflict { holder });
        }
        let expected = existing.as_ref().map(|current| current.identity.as_str());
        if self.store.conditional_set(&key, expected, &record, self.ttl).await? {
            return Ok(BindOutcome::Accepted);
        }

        debug!("Session bind for account {} lost a concurrent write", account_id);
        let winner = self.store.get(&key).await?;
        if let Some(holder) = Self::foreign_holder(winner.as_ref(), identity, now) {
            return Ok(BindOutcome::Conflict { holder });
        }
        let expected = winner.as_ref().map(|current| current.identity.as_str());
        if self.store.conditional_set(&key, expected, &record, self.ttl).await? {
            return Ok(BindOutcome::Accepted);
        }

        Err(DatabaseError::Contention)
    }

    fn foreign_holder(record: Option<&SessionRecord>, identity: &str, now: DateTime<Utc>) -> Option<String> {
        record
            .filter(|current| !current.is_expired(now) && current.identity != identity)
            .map(|current| current.identity.clone())
    }
}
