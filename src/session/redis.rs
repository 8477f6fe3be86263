use async_trait::async_trait;
use chrono::Duration;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use tracing::info;

use crate::error::DatabaseError;
use crate::session::store::{SessionRecord, SessionStore};

/// Runs server-side, so the read, the identity comparison and the write
/// happen as one step no matter how many processes share the store.
///
/// KEYS[1] session key
/// ARGV[1] "1" when a live binding is expected, "0" when none is
/// ARGV[2] expected identity
/// ARGV[3] encoded record
/// ARGV[4] ttl in milliseconds
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    if ARGV[1] ~= '1' then
        return 0
    end
    local decoded = cjson.decode(current)
    if decoded['identity'] ~= ARGV[2] then
        return 0
    end
elseif ARGV[1] == '1' then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// `SessionStore` on Redis. Expiry is delegated to Redis key TTLs.
pub struct RedisSessionStore {
    conn: ConnectionManager,
    compare_and_set: Arc<Script>,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> Result<Self, DatabaseError> {
        let client = Client::open(url)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Connected to Redis session store");

        Ok(Self {
            conn,
            compare_and_set: Arc::new(Script::new(COMPARE_AND_SET)),
        })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;

        raw.map(|raw| SessionRecord::decode(&raw)).transpose()
    }

    async fn conditional_set(
        &self,
        key: &str,
        expected_identity: Option<&str>,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.conn.clone();
        let (expects_binding, expected) = match expected_identity {
            Some(identity) => ("1", identity),
            None => ("0", ""),
        };

        let written: i64 = self
            .compare_and_set
            .key(key)
            .arg(expects_binding)
            .arg(expected)
            .arg(record.encode()?)
            .arg(ttl.num_milliseconds().max(1))
            .invoke_async(&mut conn)
            .await?;

        Ok(written == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    async fn connect() -> RedisSessionStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
        RedisSessionStore::connect(&url).await.expect("Failed to connect to Redis")
    }

    fn record(identity: &str, token: &str) -> SessionRecord {
        SessionRecord {
            account_id: Uuid::new_v4(),
            identity: identity.into(),
            token: token.into(),
            expires_at: Utc::now() + Duration::hours(24),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    async fn test_compare_and_set_round() {
        let store = connect().await;
        let key = format!("auth:user:{}", Uuid::new_v4());

        let first = record("1.2.3.4", "t1");
        assert!(store.conditional_set(&key, None, &first, Duration::seconds(30)).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(first.clone()));

        let intruder = record("9.9.9.9", "t2");
        assert!(!store.conditional_set(&key, None, &intruder, Duration::seconds(30)).await.unwrap());
        assert!(!store.conditional_set(&key, Some("9.9.9.9"), &intruder, Duration::seconds(30)).await.unwrap());

        let refresh = record("1.2.3.4", "t3");
        assert!(store.conditional_set(&key, Some("1.2.3.4"), &refresh, Duration::seconds(30)).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().token, "t3");
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    async fn test_entry_expires() {
        let store = connect().await;
        let key = format!("auth:user:{}", Uuid::new_v4());

        let rec = record("1.2.3.4", "t1");
        assert!(store.conditional_set(&key, None, &rec, Duration::milliseconds(50)).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
