use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::session::store::{SessionRecord, SessionStore};

struct Entry {
    record: SessionRecord,
    evict_at: DateTime<Utc>,
}

/// In-process `SessionStore`. One lock over the map makes `conditional_set`
/// atomic with respect to every other call on the same instance.
#[derive(Clone)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of entries still alive at the current instant.
    pub async fn live_entries(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| now < entry.evict_at)
            .count()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if now < entry.evict_at => return Ok(Some(entry.record.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        entries.remove(key);
        Ok(None)
    }

    async fn conditional_set(
        &self,
        key: &str,
        expected_identity: Option<&str>,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let current = entries
            .get(key)
            .filter(|entry| now < entry.evict_at)
            .map(|entry| entry.record.identity.as_str());

        if current != expected_identity {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                record: record.clone(),
                evict_at: now + ttl,
            },
        );
        Ok(true)
    }
}
