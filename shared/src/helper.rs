// ============================================================================
// Consumer Helper & Lock Wrapper
// ============================================================================
//
// `LockedHandler` decorates a handler with a distributed lock. To the receive
// loop it is just another handler: a lock that cannot be taken becomes
// `HandlerError::LockNotAcquired`, which leaves the message unacked so the
// broker redelivers it later.
//
// Lock keys:
//   PerMessage      mq:public:lock:{topic}:{lock_key}:{message_id}
//   PerBusinessKey  mq:biz:lock:{topic}:{lock_key}
//
// The lock is released on every exit path, including a panicking handler
// (the panic is re-raised after release).
//
// ============================================================================

use crate::consumer::{ConsumeContext, MessageConsumer, MessageHandler, SharedHandler};
use crate::distlock::Locker;
use crate::message::Message;
use async_trait::async_trait;
use futures_util::FutureExt;
use mq_config::{LockConfig, DEFAULT_LOCK_EXPIRY_MS, DEFAULT_LOCK_TIMEOUT_MS};
use mq_error::{HandlerError, MqResult};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

/// What the lock serializes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// One physical message at a time (redelivery races between instances)
    PerMessage,
    /// Every message touching the same business entity
    PerBusinessKey,
}

impl LockScope {
    pub fn lock_key(&self, topic: &str, lock_key: &str, message_id: &str) -> String {
        match self {
            LockScope::PerMessage => {
                format!("mq:public:lock:{}:{}:{}", topic, lock_key, message_id)
            }
            LockScope::PerBusinessKey => format!("mq:biz:lock:{}:{}", topic, lock_key),
        }
    }
}

/// Lock settings for a wrapped handler
///
/// Unset or zero durations fall back to 30s expiry and 5s wait. Durations
/// below one millisecond are rounded up to one millisecond.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerLockOptions {
    pub lock_key: String,
    pub lock_expiry: Option<Duration>,
    pub lock_timeout: Option<Duration>,
}

impl HandlerLockOptions {
    pub fn new(lock_key: impl Into<String>) -> Self {
        Self {
            lock_key: lock_key.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            lock_key: config.lock_key.clone(),
            lock_expiry: Some(config.expiry()),
            lock_timeout: Some(config.timeout()),
        }
    }

    pub fn lock_expiry(mut self, expiry: Duration) -> Self {
        self.lock_expiry = Some(expiry);
        self
    }

    pub fn lock_expiry_ms(self, millis: u64) -> Self {
        self.lock_expiry(Duration::from_millis(millis))
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn lock_timeout_ms(self, millis: u64) -> Self {
        self.lock_timeout(Duration::from_millis(millis))
    }

    pub fn effective_expiry(&self) -> Duration {
        normalize(self.lock_expiry, DEFAULT_LOCK_EXPIRY_MS)
    }

    pub fn effective_timeout(&self) -> Duration {
        normalize(self.lock_timeout, DEFAULT_LOCK_TIMEOUT_MS)
    }
}

fn normalize(value: Option<Duration>, default_ms: u64) -> Duration {
    match value {
        None => Duration::from_millis(default_ms),
        Some(d) if d.is_zero() => Duration::from_millis(default_ms),
        Some(d) => d.max(Duration::from_millis(1)),
    }
}

/// Handler wrapped in a distributed lock
pub struct LockedHandler {
    inner: SharedHandler,
    locker: Arc<dyn Locker>,
    options: HandlerLockOptions,
    scope: LockScope,
    trace_spans: bool,
}

impl LockedHandler {
    pub fn new(
        inner: SharedHandler,
        locker: Arc<dyn Locker>,
        options: HandlerLockOptions,
        scope: LockScope,
    ) -> Self {
        Self {
            inner,
            locker,
            options,
            scope,
            trace_spans: false,
        }
    }

    /// Run the inner handler inside an `mq.handle_message` span
    pub fn with_trace_spans(mut self, enabled: bool) -> Self {
        self.trace_spans = enabled;
        self
    }
}

#[async_trait]
impl MessageHandler for LockedHandler {
    async fn handle(&self, ctx: &ConsumeContext, message: &Message) -> Result<(), HandlerError> {
        with_lock(
            self.locker.as_ref(),
            self.scope,
            &self.options,
            self.trace_spans,
            ctx,
            message,
            self.inner.as_ref(),
        )
        .await
    }
}

async fn with_lock(
    locker: &dyn Locker,
    scope: LockScope,
    options: &HandlerLockOptions,
    trace_spans: bool,
    ctx: &ConsumeContext,
    message: &Message,
    handler: &dyn MessageHandler,
) -> Result<(), HandlerError> {
    let key = scope.lock_key(message.topic(), &options.lock_key, message.message_id());

    let handle = match locker
        .acquire(&key, options.effective_expiry(), options.effective_timeout())
        .await
    {
        Ok(Some(handle)) => handle,
        Ok(None) => {
            info!(
                topic = %message.topic(),
                message_id = %message.message_id(),
                lock_key = %key,
                "Message is being processed by another instance, skipping"
            );
            return Err(HandlerError::LockNotAcquired { key });
        }
        Err(e) => {
            error!(lock_key = %key, error = %e, "Lock provider failed");
            return Err(HandlerError::Other(e.context(format!("acquire lock '{}'", key))));
        }
    };

    let outcome = if trace_spans {
        let span = info_span!(
            "mq.handle_message",
            lock_key = %key,
            message_id = %message.message_id()
        );
        AssertUnwindSafe(handler.handle(ctx, message).instrument(span))
            .catch_unwind()
            .await
    } else {
        AssertUnwindSafe(handler.handle(ctx, message))
            .catch_unwind()
            .await
    };

    match locker.release(handle).await {
        Ok(true) => {}
        Ok(false) => warn!(lock_key = %key, "Lock expired before the handler finished"),
        Err(e) => error!(lock_key = %key, error = %e, "Failed to release lock"),
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Starts consumers, optionally behind a distributed lock
pub struct MessageHandlerHelper {
    locker: Arc<dyn Locker>,
    trace_spans: bool,
}

impl MessageHandlerHelper {
    pub fn new(locker: Arc<dyn Locker>) -> Self {
        Self {
            locker,
            trace_spans: false,
        }
    }

    pub fn with_trace_spans(mut self, enabled: bool) -> Self {
        self.trace_spans = enabled;
        self
    }

    /// Start `consumer` and subscribe `handler` without locking
    pub async fn start_consumer<H>(&self, consumer: &MessageConsumer, handler: H) -> MqResult<()>
    where
        H: MessageHandler + 'static,
    {
        consumer.start().await?;
        consumer.subscribe(handler).await
    }

    /// Start `consumer` with every message processed under a per-message lock
    pub async fn start_consumer_with_lock<H>(
        &self,
        consumer: &MessageConsumer,
        options: HandlerLockOptions,
        handler: H,
    ) -> MqResult<()>
    where
        H: MessageHandler + 'static,
    {
        let locked = self.wrap(Arc::new(handler), options, LockScope::PerMessage);
        consumer.start().await?;
        consumer.subscribe(locked).await
    }

    /// Wrap `handler` in a lock of the given scope
    pub fn wrap(
        &self,
        handler: SharedHandler,
        options: HandlerLockOptions,
        scope: LockScope,
    ) -> LockedHandler {
        LockedHandler::new(handler, self.locker.clone(), options, scope)
            .with_trace_spans(self.trace_spans)
    }

    /// Run `handler` once for `message` under the per-business-key lock
    pub async fn handle_message_with_lock<H>(
        &self,
        ctx: &ConsumeContext,
        message: &Message,
        options: &HandlerLockOptions,
        handler: &H,
    ) -> Result<(), HandlerError>
    where
        H: MessageHandler,
    {
        with_lock(
            self.locker.as_ref(),
            LockScope::PerBusinessKey,
            options,
            self.trace_spans,
            ctx,
            message,
            handler,
        )
        .await
    }
}
