// ============================================================================
// Failure Hooks
// ============================================================================
//
// Optional strategies injected when the consumer is built:
//
// - `ErrorHook`: runs on every handler failure. Decides whether the message
//   should be acknowledged right away, regardless of the retry limit.
// - `MaxRetriesHook`: runs once when a message has used up its
//   delivery attempts, just before it is dropped (acked).
//
// Both run inside the receive loop with a fresh, non-deadlined context. They
// must not block indefinitely: a stuck hook stalls the whole consumer.
// Hook failures are logged and never stop the loop.
//
// ============================================================================

use super::context::ConsumeContext;
use crate::message::Message;
use async_trait::async_trait;
use mq_error::HandlerError;
use std::sync::Arc;

/// What the error hook decided
#[derive(Debug, Default)]
pub struct ErrorHookOutcome {
    /// Acknowledge the message now, even if retries remain
    pub auto_ack: bool,
    /// Failure inside the hook itself (logged only)
    pub error: Option<anyhow::Error>,
}

impl ErrorHookOutcome {
    /// Leave the message for redelivery
    pub fn retry() -> Self {
        Self::default()
    }

    pub fn ack() -> Self {
        Self {
            auto_ack: true,
            error: None,
        }
    }

    pub fn with_error(mut self, error: anyhow::Error) -> Self {
        self.error = Some(error);
        self
    }
}

#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(
        &self,
        ctx: &ConsumeContext,
        message: &Message,
        error: &HandlerError,
    ) -> ErrorHookOutcome;
}

#[async_trait]
pub trait MaxRetriesHook: Send + Sync {
    async fn on_max_retries(
        &self,
        ctx: &ConsumeContext,
        message: &Message,
        error: &HandlerError,
    ) -> anyhow::Result<()>;
}

/// Hooks a consumer was built with
#[derive(Clone, Default)]
pub struct ConsumerHooks {
    pub error: Option<Arc<dyn ErrorHook>>,
    pub max_retries: Option<Arc<dyn MaxRetriesHook>>,
}

impl ConsumerHooks {
    pub fn with_error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.error = Some(hook);
        self
    }

    pub fn with_max_retries_hook(mut self, hook: Arc<dyn MaxRetriesHook>) -> Self {
        self.max_retries = Some(hook);
        self
    }
}

impl std::fmt::Debug for ConsumerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHooks")
            .field("error", &self.error.is_some())
            .field("max_retries", &self.max_retries.is_some())
            .finish()
    }
}
