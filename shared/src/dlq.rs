// ============================================================================
// Dead Letter Queue (DLQ) Hook
// ============================================================================
//
// Keeps poison messages instead of silently dropping them.
//
// When a message uses up its delivery attempts the receive loop acks it.
// Installed as the max-retries hook, `DeadLetterPublisher` first copies it to
// the stream `{stream_prefix}{topic}-dlq`, where it can be inspected, replayed
// or discarded by hand.
//
// Extra properties on the dead-lettered copy:
//   dlqOriginMessageId  - broker ID of the original message
//   dlqFailureReason    - last handler error
//   dlqRetryCount       - delivery attempts used
//   dlqDeadLetteredAt   - RFC 3339 timestamp
//
// A failed publish is returned to the loop, which logs it and still drops
// the message.
//
// ============================================================================

use crate::broker::redis_streams::{publish, stream_key};
use crate::consumer::{ConsumeContext, MaxRetriesHook};
use crate::message::{Message, OutboundMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mq_config::{RedisStreamsConfig, DLQ_TOPIC_SUFFIX};
use mq_error::HandlerError;
use mq_redis::RedisClient;
use tracing::warn;

pub const PROPERTY_DLQ_ORIGIN_MESSAGE_ID: &str = "dlqOriginMessageId";
pub const PROPERTY_DLQ_FAILURE_REASON: &str = "dlqFailureReason";
pub const PROPERTY_DLQ_RETRY_COUNT: &str = "dlqRetryCount";
pub const PROPERTY_DLQ_DEAD_LETTERED_AT: &str = "dlqDeadLetteredAt";

/// DLQ topic for a topic
pub fn dlq_topic(topic: &str) -> String {
    format!("{}{}", topic, DLQ_TOPIC_SUFFIX)
}

/// Dead-lettered copy of `message`
pub fn dead_letter_message(
    message: &Message,
    failure_reason: &str,
    retry_count: u32,
    dead_lettered_at: DateTime<Utc>,
) -> OutboundMessage {
    let mut outbound = message.to_outbound();
    outbound.topic = dlq_topic(message.topic());
    outbound.properties.insert(
        PROPERTY_DLQ_ORIGIN_MESSAGE_ID.to_string(),
        message.message_id().to_string(),
    );
    outbound.properties.insert(
        PROPERTY_DLQ_FAILURE_REASON.to_string(),
        failure_reason.to_string(),
    );
    outbound
        .properties
        .insert(PROPERTY_DLQ_RETRY_COUNT.to_string(), retry_count.to_string());
    outbound.properties.insert(
        PROPERTY_DLQ_DEAD_LETTERED_AT.to_string(),
        dead_lettered_at.to_rfc3339(),
    );
    outbound
}

/// Max-retries hook that publishes to the DLQ stream
pub struct DeadLetterPublisher {
    client: RedisClient,
    stream_prefix: String,
    max_len: usize,
}

impl DeadLetterPublisher {
    pub fn new(client: RedisClient, config: &RedisStreamsConfig) -> Self {
        Self {
            client,
            stream_prefix: config.stream_prefix.clone(),
            max_len: config.stream_max_len,
        }
    }
}

#[async_trait]
impl MaxRetriesHook for DeadLetterPublisher {
    async fn on_max_retries(
        &self,
        ctx: &ConsumeContext,
        message: &Message,
        error: &HandlerError,
    ) -> Result<()> {
        let outbound = dead_letter_message(
            message,
            &error.to_string(),
            ctx.delivery_attempt(),
            Utc::now(),
        );
        let stream = stream_key(&self.stream_prefix, &outbound.topic);

        let mut client = self.client.clone();
        let dlq_id = publish(&mut client, &stream, self.max_len, &outbound)
            .await
            .context("Failed to publish message to DLQ")?;

        warn!(
            message_id = %message.message_id(),
            dlq_stream = %stream,
            dlq_message_id = %dlq_id,
            retry_count = ctx.delivery_attempt(),
            reason = %error,
            "Message moved to DLQ"
        );
        Ok(())
    }
}
