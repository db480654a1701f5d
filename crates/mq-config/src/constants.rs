// ============================================================================
// Configuration defaults
// ============================================================================

/// Messages pulled per receive call when BatchSize is unset or <= 0
pub const DEFAULT_BATCH_SIZE: u32 = 16;

/// Per-message consume timeout (also the broker invisibility duration)
pub const DEFAULT_CONSUME_TIMEOUT_MS: u64 = 60_000;

/// Backoff after an empty batch or a failed receive
pub const DEFAULT_MAX_AWAIT_TIME_MS: u64 = 5_000;

/// Lock auto-release duration
pub const DEFAULT_LOCK_EXPIRY_MS: u64 = 30_000;

/// Maximum wait to acquire a lock
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Delay between lock acquisition attempts
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 100;

pub const DEFAULT_LOCK_KEY_PREFIX: &str = "lock:";

pub const DEFAULT_STREAM_PREFIX: &str = "mq:stream:";

pub const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

/// Suffix appended to a topic to form its dead-letter topic
pub const DLQ_TOPIC_SUFFIX: &str = "-dlq";
