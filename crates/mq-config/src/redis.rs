// ============================================================================
// Redis Streams Broker Configuration
// ============================================================================

use crate::constants::{DEFAULT_STREAM_MAX_LEN, DEFAULT_STREAM_PREFIX};

/// Settings for the Redis Streams broker adapter
#[derive(Clone, Debug)]
pub struct RedisStreamsConfig {
    /// Prefix for stream keys: "{stream_prefix}{topic}"
    pub stream_prefix: String,
    /// Consumer name inside the consumer group (unique per process)
    pub consumer_name: String,
    /// Approximate MAXLEN applied on publish
    pub stream_max_len: usize,
    /// Re-publish messages that exhausted their retries to "{topic}-dlq"
    pub dlq_enabled: bool,
}

impl RedisStreamsConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            stream_prefix: std::env::var("MQ_STREAM_PREFIX")
                .unwrap_or_else(|_| DEFAULT_STREAM_PREFIX.to_string()),
            consumer_name: std::env::var("MQ_CONSUMER_NAME")
                .unwrap_or_else(|_| generate_consumer_name()),
            stream_max_len: std::env::var("MQ_STREAM_MAX_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STREAM_MAX_LEN),
            dlq_enabled: std::env::var("MQ_DLQ_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        }
    }
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            consumer_name: generate_consumer_name(),
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
            dlq_enabled: true,
        }
    }
}

fn generate_consumer_name() -> String {
    format!("consumer-{}", uuid::Uuid::new_v4().simple())
}
