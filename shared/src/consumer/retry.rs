//! Retry/drop decision for failed messages
//!
//! Pure logic, no I/O. The receive loop feeds it the broker-tracked delivery
//! attempt and the error hook's verdict and acts on the returned decision.

/// Bounded (or unbounded) redelivery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_reconsume_times: u32,
}

/// What to do with a message whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDecision {
    /// Ack immediately because the error hook asked for it
    pub auto_ack: bool,
    /// Delivery attempts used up: run the max-retries hook, then drop
    pub exhausted: bool,
}

impl FailureDecision {
    /// Message stays unacked and the broker redelivers it
    pub fn redeliver(&self) -> bool {
        !self.auto_ack && !self.exhausted
    }

    /// Ack still owed after the max-retries hook ran
    pub fn ack_after_hook(&self) -> bool {
        self.exhausted && !self.auto_ack
    }
}

impl RetryPolicy {
    /// `0` means retry forever
    pub fn new(max_reconsume_times: u32) -> Self {
        Self {
            max_reconsume_times,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn max_reconsume_times(&self) -> u32 {
        self.max_reconsume_times
    }

    pub fn is_exhausted(&self, delivery_attempt: u32) -> bool {
        self.max_reconsume_times > 0 && delivery_attempt >= self.max_reconsume_times
    }

    pub fn decide(&self, delivery_attempt: u32, hook_auto_ack: bool) -> FailureDecision {
        FailureDecision {
            auto_ack: hook_auto_ack,
            exhausted: self.is_exhausted(delivery_attempt),
        }
    }
}
