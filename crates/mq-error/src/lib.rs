// ============================================================================
// MQ Error - Error taxonomy for the message consumption engine
// ============================================================================
//
// Two families of errors live here:
//
// - `MqError`: lifecycle and infrastructure failures. Only connection failures
//   and Start/Subscribe/Shutdown misuse ever reach the caller as returned errors.
// - `HandlerError`: what a message handler returns. These never escape the
//   receive loop; they drive the retry/drop policy and are surfaced through
//   logs and the optional hooks.
//
// ============================================================================

use std::time::Duration;
use thiserror::Error;

pub type MqResult<T> = Result<T, MqError>;

/// Consumer lifecycle and broker errors
#[derive(Error, Debug)]
pub enum MqError {
    /// Broker client could not be created or started. Fatal to `start()`.
    #[error("Broker connection error: {0}")]
    Connection(#[source] anyhow::Error),

    /// `subscribe()` called before the consumer was ever started
    #[error("Consumer is not initialized, call start() first")]
    NotInitialized,

    /// `subscribe()` called on a consumer that is not running
    #[error("Consumer is not running, call start() first")]
    NotRunning,

    /// A receive loop is already active for this consumer
    #[error("Consumer already has an active subscription on topic '{0}'")]
    AlreadySubscribed(String),

    /// Pull from the broker failed (recovered inside the receive loop)
    #[error("Receive error: {0}")]
    Receive(#[source] anyhow::Error),

    /// Acknowledgement failed (logged only, never retried)
    #[error("Ack error for message {message_id}: {source}")]
    Ack {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Distributed lock could not be obtained
    #[error("Failed to acquire distributed lock '{0}'")]
    LockAcquisitionFailed(String),

    /// Invalid consumer configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error returned by a message handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The per-message consume deadline elapsed
    #[error("Consume deadline exceeded ({0:?})")]
    DeadlineExceeded(Duration),

    /// Another instance holds the lock for this message or business key.
    /// The message is left unacknowledged so the broker redelivers it.
    #[error("Message is being processed by another instance (lock '{key}' not acquired)")]
    LockNotAcquired { key: String },

    /// Business-level rejection
    #[error("Business error: {0}")]
    Business(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn business(message: impl Into<String>) -> Self {
        HandlerError::Business(message.into())
    }

    /// True for the timeout specialization of handler errors
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::DeadlineExceeded(_))
    }

    /// Lock contention as a consumer error, for any other error `None`
    pub fn lock_failure(&self) -> Option<MqError> {
        match self {
            HandlerError::LockNotAcquired { key } => Some(MqError::LockAcquisitionFailed(key.clone())),
            _ => None,
        }
    }
}
