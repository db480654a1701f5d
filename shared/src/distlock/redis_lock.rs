//! Redis lock provider
//!
//! `SET {prefix}{key} {token} NX PX {expiry}`, retried every `retry_delay`
//! until `timeout`. Release only deletes the key while it still holds our
//! token, so a lock that expired and was taken by someone else survives.

use super::{acquire_tries, LockHandle, Locker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use mq_config::LockConfig;
use mq_redis::{RedisClient, Script};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLocker {
    client: RedisClient,
    key_prefix: String,
    retry_delay: Duration,
    unlock: Script,
}

impl RedisLocker {
    pub fn new(client: RedisClient, key_prefix: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            retry_delay: retry_delay.max(Duration::from_millis(1)),
            unlock: RedisClient::create_script(UNLOCK_SCRIPT),
        }
    }

    pub fn from_config(client: RedisClient, config: &LockConfig) -> Self {
        Self::new(client, config.key_prefix.clone(), config.retry_delay())
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn acquire(
        &self,
        key: &str,
        expiry: Duration,
        timeout: Duration,
    ) -> Result<Option<LockHandle>> {
        let mut client = self.client.clone();
        let redis_key = self.redis_key(key);
        let token = Uuid::new_v4().to_string();
        let expiry_ms = (expiry.as_millis() as u64).max(1);
        let tries = acquire_tries(timeout, self.retry_delay);

        for attempt in 1..=tries {
            let acquired = client
                .set_nx_px(&redis_key, &token, expiry_ms)
                .await
                .with_context(|| format!("Failed to acquire lock '{}'", redis_key))?;

            if acquired {
                debug!(key = %redis_key, attempt = attempt, "Lock acquired");
                return Ok(Some(LockHandle::new(key, token)));
            }

            if attempt < tries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        debug!(key = %redis_key, tries = tries, "Lock still held by another owner");
        Ok(None)
    }

    async fn release(&self, handle: LockHandle) -> Result<bool> {
        let mut client = self.client.clone();
        let redis_key = self.redis_key(handle.key());

        let deleted = client
            .eval_int(&self.unlock, &redis_key, &[handle.token()])
            .await
            .with_context(|| format!("Failed to release lock '{}'", redis_key))?;

        if deleted == 0 {
            warn!(key = %redis_key, "Lock expired before release");
        }
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_redis_lock_exclusive() -> Result<()> {
        let client = RedisClient::connect(&redis_url()).await?;
        let locker = RedisLocker::new(client, "mq-test:lock:", Duration::from_millis(10));

        let first = locker
            .acquire("orders:42", Duration::from_secs(5), Duration::ZERO)
            .await?
            .expect("first acquire");

        let second = locker
            .acquire("orders:42", Duration::from_secs(5), Duration::from_millis(50))
            .await?;
        assert!(second.is_none());

        assert!(locker.release(first).await?);

        let third = locker
            .acquire("orders:42", Duration::from_secs(5), Duration::ZERO)
            .await?
            .expect("acquire after release");
        assert!(locker.release(third).await?);
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_redis_lock_release_after_expiry() -> Result<()> {
        let client = RedisClient::connect(&redis_url()).await?;
        let locker = RedisLocker::new(client, "mq-test:lock:", Duration::from_millis(10));

        let stale = locker
            .acquire("orders:43", Duration::from_millis(20), Duration::ZERO)
            .await?
            .expect("acquire");
        tokio::time::sleep(Duration::from_millis(60)).await;

        let fresh = locker
            .acquire("orders:43", Duration::from_secs(5), Duration::ZERO)
            .await?
            .expect("re-acquire after expiry");

        // The stale owner must not delete the new owner's lock
        assert!(!locker.release(stale).await?);
        assert!(locker.release(fresh).await?);
        Ok(())
    }
}
