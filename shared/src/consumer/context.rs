// ============================================================================
// Consume Context
// ============================================================================
//
// Per-invocation context handed to handlers and hooks. Carries the optional
// deadline (now + consume timeout for handlers, none for hooks), the
// broker-tracked delivery attempt, and a token the receive loop cancels once
// it is done with the message.
//
// The loop never aborts a handler; honouring the deadline is cooperative via
// `done()` / `check()`.
//
// ============================================================================

use mq_error::HandlerError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ConsumeContext {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    delivery_attempt: u32,
    token: CancellationToken,
}

impl ConsumeContext {
    /// Context without a deadline
    pub fn background() -> Self {
        Self {
            deadline: None,
            timeout: None,
            delivery_attempt: 1,
            token: CancellationToken::new(),
        }
    }

    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
            ..Self::background()
        }
    }

    pub fn with_delivery_attempt(mut self, delivery_attempt: u32) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }

    /// Fresh non-deadlined context for the same delivery (hooks)
    pub fn detached(&self) -> Self {
        Self::background().with_delivery_attempt(self.delivery_attempt)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// How many times the broker has delivered this message (1 = first)
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the deadline passes or the context is cancelled
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.token.cancelled() => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// `Err(DeadlineExceeded)` once the deadline has passed
    pub fn check(&self) -> Result<(), HandlerError> {
        if self.is_expired() {
            return Err(HandlerError::DeadlineExceeded(
                self.timeout.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for ConsumeContext {
    fn default() -> Self {
        Self::background()
    }
}
