// ============================================================================
// MQ Config - Centralized configuration management
// ============================================================================
//
// Configuration for the consumer engine and the worker process.
// Everything is loaded from environment variables with sensible defaults;
// a `.env` file is honoured when present.
//
// ============================================================================

mod constants;
mod consumer;
mod lock;
mod redis;

pub use constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CONSUME_TIMEOUT_MS, DEFAULT_LOCK_EXPIRY_MS,
    DEFAULT_LOCK_KEY_PREFIX, DEFAULT_LOCK_RETRY_DELAY_MS, DEFAULT_LOCK_TIMEOUT_MS,
    DEFAULT_MAX_AWAIT_TIME_MS, DEFAULT_STREAM_MAX_LEN, DEFAULT_STREAM_PREFIX, DLQ_TOPIC_SUFFIX,
};
pub use consumer::ConsumerOptions;
pub use lock::LockConfig;
pub use redis::RedisStreamsConfig;

use anyhow::Result;

/// Environment prefix of the worker's consumer settings
pub const WORKER_CONSUMER_PREFIX: &str = "MQ_CONSUMER";

/// Main configuration structure for the consume worker
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_url: String,
    pub rust_log: String,

    // Sub-configurations
    pub consumer: ConsumerOptions,
    pub lock: LockConfig,
    pub streams: RedisStreamsConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let consumer = ConsumerOptions::from_env(WORKER_CONSUMER_PREFIX)?;
        let lock = LockConfig::from_env();
        let streams = RedisStreamsConfig::from_env();

        if lock.enabled && lock.lock_key.trim().is_empty() {
            anyhow::bail!("LOCK_KEY must be set when LOCK_ENABLED=true");
        }

        Ok(Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            consumer,
            lock,
            streams,
        })
    }

    /// Redis URL with credentials masked, for logging
    pub fn redis_url_safe(&self) -> String {
        if let Some(at_pos) = self.redis_url.find('@') {
            let protocol_end = self.redis_url.find("://").map(|p| p + 3).unwrap_or(0);
            format!(
                "{}***{}",
                &self.redis_url[..protocol_end],
                &self.redis_url[at_pos..]
            )
        } else {
            self.redis_url.clone()
        }
    }
}
