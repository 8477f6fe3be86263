use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc, Duration};
use tracing::debug;

use crate::config::RateLimitSettings;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_size: Duration,
    pub limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::minutes(1),
            limit: 5,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            window_size: Duration::seconds(settings.window_secs),
            limit: settings.max_requests,
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Fixed-window request counter keyed by an arbitrary string.
///
/// The whole table sits behind one lock; every operation on it is O(1)
/// apart from `sweep`, and the lock is never held across I/O.
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, RateWindow>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one request for `key` at `now` and reports whether it may proceed.
    pub async fn allow(&self, key: &str, now: DateTime<Utc>) -> bool {
        if self.config.limit == 0 {
            return false;
        }

        let mut windows = self.windows.lock().await;

        if let Some(window) = windows.get_mut(key) {
            if now - window.window_start < self.config.window_size {
                if window.count >= self.config.limit {
                    return false;
                }
                window.count += 1;
                return true;
            }
        }

        // No window yet, or the previous one has elapsed
        windows.insert(
            key.to_string(),
            RateWindow {
                window_start: now,
                count: 1,
            },
        );
        true
    }

    /// Drops windows that have fully elapsed at `now`. Returns how many were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self.windows.lock().await;
        let before = windows.len();

        windows.retain(|_, window| now - window.window_start < self.config.window_size);

        let removed = before - windows.len();
        if removed > 0 {
            debug!("Rate limiter sweep evicted {} expired windows", removed);
        }
        removed
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}
