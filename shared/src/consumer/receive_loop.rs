// ============================================================================
// Receive Loop
// ============================================================================
//
// One background task per active subscription:
//
//   loop {
//     cancelled?            -> exit
//     receive(batch_size, invisibility = consume_timeout)
//       error               -> pause(max_await), continue
//       empty               -> pause(max_await), continue
//     for each message, in order:
//       handler(ctx with deadline = now + consume_timeout, message)
//       Ok                  -> ack (unless manual ack)
//       Err                 -> error hook, retry policy, maybe ack / drop
//   }
//
// Cancellation is observed only at the top of the loop (and during pauses):
// a batch that has started is always finished. Nothing that happens to a
// single message can end the loop; a panicking handler counts as a failure.
//
// ============================================================================

use super::context::ConsumeContext;
use super::handler::SharedHandler;
use super::hooks::ConsumerHooks;
use super::retry::RetryPolicy;
use crate::broker::{BrokerClient, MessageView};
use crate::message::Message;
use crate::metrics;
use futures_util::FutureExt;
use mq_config::ConsumerOptions;
use mq_error::{HandlerError, MqError};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loop parameters with defaults already applied
#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub topic: String,
    pub consumer_group: String,
    pub batch_size: u32,
    pub consume_timeout: Duration,
    pub max_await_time: Duration,
    pub manual_ack: bool,
    pub policy: RetryPolicy,
}

impl From<&ConsumerOptions> for LoopSettings {
    fn from(options: &ConsumerOptions) -> Self {
        Self {
            topic: options.topic.clone(),
            consumer_group: options.consumer_group.clone(),
            batch_size: options.effective_batch_size(),
            consume_timeout: options.consume_timeout(),
            max_await_time: options.max_await_time(),
            manual_ack: options.manual_ack,
            policy: RetryPolicy::new(options.max_reconsume_times),
        }
    }
}

pub(crate) struct ReceiveLoop {
    client: Arc<dyn BrokerClient>,
    handler: SharedHandler,
    hooks: ConsumerHooks,
    settings: LoopSettings,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    pub(crate) fn new(
        client: Arc<dyn BrokerClient>,
        handler: SharedHandler,
        hooks: ConsumerHooks,
        settings: LoopSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            handler,
            hooks,
            settings,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        let topic = self.settings.topic.as_str();
        info!(
            topic = %topic,
            group = %self.settings.consumer_group,
            batch_size = self.settings.batch_size,
            consume_timeout_ms = self.settings.consume_timeout.as_millis() as u64,
            max_reconsume_times = self.settings.policy.max_reconsume_times(),
            "Receive loop started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let batch = match self
                .client
                .receive(self.settings.batch_size, self.settings.consume_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    let err = MqError::Receive(e);
                    warn!(
                        topic = %topic,
                        error = %err,
                        retry_in_ms = self.settings.max_await_time.as_millis() as u64,
                        "Failed to receive messages, backing off"
                    );
                    metrics::RECEIVE_ERRORS_TOTAL
                        .with_label_values(&[topic])
                        .inc();
                    self.pause().await;
                    continue;
                }
            };

            if batch.is_empty() {
                self.pause().await;
                continue;
            }

            debug!(topic = %topic, count = batch.len(), "Received batch");
            metrics::MESSAGES_RECEIVED_TOTAL
                .with_label_values(&[topic])
                .inc_by(batch.len() as u64);

            for view in &batch {
                self.process(view).await;
            }
        }

        info!(topic = %topic, "Receive loop stopped");
    }

    /// Sleep `max_await_time`, waking early on cancellation
    async fn pause(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.max_await_time) => {}
        }
    }

    async fn process(&self, view: &MessageView) {
        let topic = self.settings.topic.as_str();
        let message = Message::from(view);
        let ctx = ConsumeContext::with_timeout(self.settings.consume_timeout)
            .with_delivery_attempt(view.delivery_attempt);

        let timer = metrics::HANDLER_DURATION_SECONDS
            .with_label_values(&[topic])
            .start_timer();
        let result = AssertUnwindSafe(self.handler.handle(&ctx, &message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Other(anyhow::anyhow!("message handler panicked"))));
        timer.observe_duration();

        let timed_out = ctx.is_expired() || matches!(&result, Err(e) if e.is_timeout());
        // Release the per-message context whatever the outcome
        ctx.cancel();

        match result {
            Ok(()) => self.on_success(view).await,
            Err(err) => self.on_failure(view, &message, &ctx, err, timed_out).await,
        }
    }

    async fn on_success(&self, view: &MessageView) {
        metrics::MESSAGES_SUCCEEDED_TOTAL
            .with_label_values(&[self.settings.topic.as_str()])
            .inc();

        if self.settings.manual_ack {
            debug!(message_id = %view.message_id, "Manual ack mode, leaving ack to the handler");
            return;
        }
        self.ack(view).await;
    }

    async fn on_failure(
        &self,
        view: &MessageView,
        message: &Message,
        ctx: &ConsumeContext,
        err: HandlerError,
        timed_out: bool,
    ) {
        let topic = self.settings.topic.as_str();
        let attempt = view.delivery_attempt;

        metrics::MESSAGES_FAILED_TOTAL.with_label_values(&[topic]).inc();
        if timed_out {
            metrics::MESSAGES_TIMED_OUT_TOTAL.with_label_values(&[topic]).inc();
            error!(
                topic = %topic,
                message_id = %view.message_id,
                delivery_attempt = attempt,
                timeout_ms = self.settings.consume_timeout.as_millis() as u64,
                error = %err,
                "Message handler timed out"
            );
        } else if let Some(lock_err) = err.lock_failure() {
            metrics::LOCK_CONTENTION_TOTAL.with_label_values(&[topic]).inc();
            warn!(
                topic = %topic,
                message_id = %view.message_id,
                delivery_attempt = attempt,
                error = %lock_err,
                "Message locked by another consumer, leaving it for redelivery"
            );
        } else {
            error!(
                topic = %topic,
                message_id = %view.message_id,
                delivery_attempt = attempt,
                error = %err,
                "Message handler failed"
            );
        }

        // The handler's deadline may already be gone
        let hook_ctx = ctx.detached();

        let hook_auto_ack = match &self.hooks.error {
            Some(hook) => {
                let outcome = hook.on_error(&hook_ctx, message, &err).await;
                if let Some(hook_err) = outcome.error {
                    error!(
                        topic = %topic,
                        message_id = %view.message_id,
                        error = %hook_err,
                        "Error hook failed"
                    );
                }
                outcome.auto_ack
            }
            None => false,
        };

        let decision = self.settings.policy.decide(attempt, hook_auto_ack);

        if decision.auto_ack {
            info!(
                topic = %topic,
                message_id = %view.message_id,
                "Error hook requested ack"
            );
            self.ack(view).await;
        }

        if decision.exhausted {
            warn!(
                topic = %topic,
                message_id = %view.message_id,
                delivery_attempt = attempt,
                max_reconsume_times = self.settings.policy.max_reconsume_times(),
                "Max reconsume times reached, dropping message"
            );

            if let Some(hook) = &self.hooks.max_retries {
                if let Err(hook_err) = hook.on_max_retries(&hook_ctx, message, &err).await {
                    error!(
                        topic = %topic,
                        message_id = %view.message_id,
                        error = %hook_err,
                        "Max retries hook failed"
                    );
                }
            }

            if decision.ack_after_hook() {
                self.ack(view).await;
            }
            metrics::MESSAGES_DROPPED_TOTAL.with_label_values(&[topic]).inc();
        }

        if decision.redeliver() {
            debug!(
                topic = %topic,
                message_id = %view.message_id,
                delivery_attempt = attempt,
                "Message left unacked for redelivery"
            );
        }
    }

    /// Ack failures are logged, never retried
    async fn ack(&self, view: &MessageView) {
        let topic = self.settings.topic.as_str();
        match self.client.ack(view).await {
            Ok(()) => {
                metrics::MESSAGES_ACKED_TOTAL.with_label_values(&[topic]).inc();
            }
            Err(source) => {
                let err = MqError::Ack {
                    message_id: view.message_id.clone(),
                    source,
                };
                metrics::ACK_FAILURES_TOTAL.with_label_values(&[topic]).inc();
                error!(topic = %topic, error = %err, "Failed to ack message");
            }
        }
    }
}
