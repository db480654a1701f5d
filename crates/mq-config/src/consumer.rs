// ============================================================================
// Consumer Configuration
// ============================================================================
//
// One `ConsumerOptions` per subscribed topic. Built once, never mutated.
// Zero values mean "use the default" for every numeric setting, with the
// exception of `max_reconsume_times` where 0 means unlimited retries.
//
// ============================================================================

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_CONSUME_TIMEOUT_MS, DEFAULT_MAX_AWAIT_TIME_MS};
use std::time::Duration;

/// Immutable configuration of a single topic consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Topic to subscribe to
    pub topic: String,
    /// Consumer group (broker load-balances messages across its members)
    pub consumer_group: String,
    /// Tag filter expression ("*" or "" = all tags, "a || b" = either tag)
    pub consumer_tag: String,
    /// Messages pulled per receive call (<= 0 means 16)
    pub batch_size: i32,
    /// Delivery attempts before a failing message is dropped (0 = unlimited)
    pub max_reconsume_times: u32,
    /// Per-message consume timeout in milliseconds (0 = 60000)
    pub consume_timeout_ms: u64,
    /// When true, acknowledging successful messages is the handler's job
    pub manual_ack: bool,
    /// Poll/backoff interval in milliseconds (0 = 5000)
    pub max_await_time_ms: u64,
    /// Upper bound on how long shutdown waits for the receive loop
    pub shutdown_timeout_ms: Option<u64>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            topic: String::new(),
            consumer_group: String::new(),
            consumer_tag: "*".to_string(),
            batch_size: 0,
            max_reconsume_times: 0,
            consume_timeout_ms: 0,
            manual_ack: false,
            max_await_time_ms: 0,
            shutdown_timeout_ms: None,
        }
    }
}

impl ConsumerOptions {
    pub fn new(topic: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            ..Default::default()
        }
    }

    /// Load options from `{prefix}_*` environment variables
    ///
    /// e.g. with prefix `MQ_UPLOAD_CALLBACK`:
    /// `MQ_UPLOAD_CALLBACK_TOPIC`, `MQ_UPLOAD_CALLBACK_GROUP`, `MQ_UPLOAD_CALLBACK_TAG`,
    /// `MQ_UPLOAD_CALLBACK_BATCH_SIZE`, `MQ_UPLOAD_CALLBACK_MAX_RECONSUME_TIMES`,
    /// `MQ_UPLOAD_CALLBACK_CONSUME_TIMEOUT_MS`, `MQ_UPLOAD_CALLBACK_MANUAL_ACK`,
    /// `MQ_UPLOAD_CALLBACK_MAX_AWAIT_TIME_MS`, `MQ_UPLOAD_CALLBACK_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env(prefix: &str) -> anyhow::Result<Self> {
        let var = |name: &str| std::env::var(format!("{}_{}", prefix, name));

        let options = Self {
            topic: var("TOPIC").unwrap_or_default(),
            consumer_group: var("GROUP").unwrap_or_default(),
            consumer_tag: var("TAG").unwrap_or_else(|_| "*".to_string()),
            batch_size: var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_reconsume_times: var("MAX_RECONSUME_TIMES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            consume_timeout_ms: var("CONSUME_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            manual_ack: var("MANUAL_ACK")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            max_await_time_ms: var("MAX_AWAIT_TIME_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            shutdown_timeout_ms: var("SHUTDOWN_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic.trim().is_empty() {
            anyhow::bail!("Consumer topic must not be empty");
        }
        if self.consumer_group.trim().is_empty() {
            anyhow::bail!(
                "Consumer group must not be empty (topic '{}')",
                self.topic
            );
        }
        Ok(())
    }

    /// Batch size with the <= 0 default applied
    pub fn effective_batch_size(&self) -> u32 {
        if self.batch_size <= 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size as u32
        }
    }

    /// Consume timeout; doubles as the broker invisibility duration
    pub fn consume_timeout(&self) -> Duration {
        if self.consume_timeout_ms == 0 {
            Duration::from_millis(DEFAULT_CONSUME_TIMEOUT_MS)
        } else {
            Duration::from_millis(self.consume_timeout_ms)
        }
    }

    pub fn max_await_time(&self) -> Duration {
        if self.max_await_time_ms == 0 {
            Duration::from_millis(DEFAULT_MAX_AWAIT_TIME_MS)
        } else {
            Duration::from_millis(self.max_await_time_ms)
        }
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }
}
