// ============================================================================
// Distributed Lock
// ============================================================================
//
// Lock providers behind a small trait so the handler wrapper does not care
// where the lock lives:
// - `RedisLocker`: SET NX PX + compare-and-delete script, shared across
//   processes
// - `MemoryLocker`: process-local, same semantics
//
// A `LockHandle` is the proof of ownership. `release` consumes it, so a
// handle can be released at most once.
//
// ============================================================================

mod memory;
mod redis_lock;

pub use memory::MemoryLocker;
pub use redis_lock::RedisLocker;

use async_trait::async_trait;
use std::time::Duration;

/// An acquired lock
#[derive(Debug, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token written with the lock
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to take `key` for `expiry`, waiting up to `timeout`
    ///
    /// `Ok(None)` means someone else kept the lock for the whole wait.
    async fn acquire(
        &self,
        key: &str,
        expiry: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Option<LockHandle>>;

    /// Returns `false` when the lock had already expired or changed owner
    async fn release(&self, handle: LockHandle) -> anyhow::Result<bool>;
}

/// Number of acquisition attempts for a wait of `timeout`
pub(crate) fn acquire_tries(timeout: Duration, retry_delay: Duration) -> u32 {
    let delay = retry_delay.as_millis().max(1);
    let tries = timeout.as_millis() / delay;
    tries.clamp(1, u32::MAX as u128) as u32
}
