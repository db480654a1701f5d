// ============================================================================
// Distributed Lock Configuration
// ============================================================================

use crate::constants::{
    DEFAULT_LOCK_EXPIRY_MS, DEFAULT_LOCK_KEY_PREFIX, DEFAULT_LOCK_RETRY_DELAY_MS,
    DEFAULT_LOCK_TIMEOUT_MS,
};
use std::time::Duration;

/// Settings for the Redis-backed handler lock
#[derive(Clone, Debug)]
pub struct LockConfig {
    /// Wrap the handler with the per-message lock
    pub enabled: bool,
    /// Caller-chosen semantic key, embedded in every derived lock key
    pub lock_key: String,
    /// Auto-release duration in milliseconds
    pub expiry_ms: u64,
    /// Maximum wait to acquire in milliseconds
    pub timeout_ms: u64,
    /// Delay between acquisition attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Prefix prepended to every Redis lock key
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_key: String::new(),
            expiry_ms: DEFAULT_LOCK_EXPIRY_MS,
            timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            retry_delay_ms: DEFAULT_LOCK_RETRY_DELAY_MS,
            key_prefix: DEFAULT_LOCK_KEY_PREFIX.to_string(),
        }
    }
}

impl LockConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            enabled: std::env::var("LOCK_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            lock_key: std::env::var("LOCK_KEY").unwrap_or_default(),
            expiry_ms: std::env::var("LOCK_EXPIRY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOCK_EXPIRY_MS),
            timeout_ms: std::env::var("LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_MS),
            retry_delay_ms: std::env::var("LOCK_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOCK_RETRY_DELAY_MS),
            key_prefix: std::env::var("LOCK_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_LOCK_KEY_PREFIX.to_string()),
        }
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.max(1))
    }
}
