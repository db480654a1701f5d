//! Process-local lock provider
//!
//! Same contract as the Redis provider (expiry, owner token, bounded wait)
//! for tests and single-instance deployments.

use super::{acquire_tries, LockHandle, Locker};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct MemoryLocker {
    entries: Mutex<HashMap<String, Entry>>,
    retry_delay: Duration,
}

impl MemoryLocker {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retry_delay: retry_delay.max(Duration::from_millis(1)),
        }
    }

    async fn try_acquire(&self, key: &str, token: &str, expiry: Duration) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.contains_key(key) {
            return false;
        }

        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + expiry,
            },
        );
        true
    }

    /// Whether `key` is currently held
    pub async fn is_locked(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new(Duration::from_millis(mq_config::DEFAULT_LOCK_RETRY_DELAY_MS))
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn acquire(
        &self,
        key: &str,
        expiry: Duration,
        timeout: Duration,
    ) -> Result<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        let tries = acquire_tries(timeout, self.retry_delay);

        for attempt in 1..=tries {
            if self.try_acquire(key, &token, expiry).await {
                return Ok(Some(LockHandle::new(key, token)));
            }
            if attempt < tries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Ok(None)
    }

    async fn release(&self, handle: LockHandle) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(handle.key()) else {
            return Ok(false);
        };

        let live = entry.expires_at > Instant::now();
        let owned = live && entry.token == handle.token();
        // An expired entry is dropped whoever releases it
        if owned || !live {
            entries.remove(handle.key());
        }
        Ok(owned)
    }
}
