// ============================================================================
// Redis Streams Broker Adapter
// ============================================================================
//
// Implements the broker contract on top of Redis Streams consumer groups.
//
// Mapping:
// - topic              -> stream "{stream_prefix}{topic}"
// - consumer group     -> XGROUP (created on start with MKSTREAM)
// - receive            -> XAUTOCLAIM entries idle >= invisibility (redeliveries),
//                         then XREADGROUP ">" for new entries
// - invisibility       -> pending entries are only reclaimed once idle for the
//                         invisibility duration
// - delivery attempt   -> XPENDING times-delivered (XAUTOCLAIM increments it)
// - ack                -> XACK
// - tag filter         -> applied client-side; entries that do not match are
//                         acked so they never come back to this group
//
// Wire fields of an entry:
//   topic, tag, keys (JSON array), body (bytes), properties (JSON object)
//
// ============================================================================

use super::{BrokerClient, BrokerConnector, MessageView, Subscription};
use crate::filter::FilterExpression;
use crate::message::OutboundMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use mq_config::RedisStreamsConfig;
use mq_redis::{RedisClient, StreamEntryBinary};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FIELD_TOPIC: &str = "topic";
const FIELD_TAG: &str = "tag";
const FIELD_KEYS: &str = "keys";
const FIELD_BODY: &str = "body";
const FIELD_PROPERTIES: &str = "properties";

/// Stream key for a topic
pub fn stream_key(stream_prefix: &str, topic: &str) -> String {
    format!("{}{}", stream_prefix, topic)
}

/// Creates `RedisStreamsBroker`s, one Redis connection per consumer
pub struct RedisStreamsConnector {
    redis_url: String,
    config: RedisStreamsConfig,
}

impl RedisStreamsConnector {
    pub fn new(redis_url: impl Into<String>, config: RedisStreamsConfig) -> Self {
        Self {
            redis_url: redis_url.into(),
            config,
        }
    }
}

#[async_trait]
impl BrokerConnector for RedisStreamsConnector {
    async fn connect(&self, subscription: &Subscription) -> Result<Arc<dyn BrokerClient>> {
        let client = RedisClient::connect(&self.redis_url)
            .await
            .context("Failed to connect to Redis")?;

        Ok(Arc::new(RedisStreamsBroker::new(
            client,
            subscription.clone(),
            &self.config,
        )))
    }
}

/// Broker client bound to one stream and consumer group
pub struct RedisStreamsBroker {
    client: RedisClient,
    subscription: Subscription,
    stream_key: String,
    consumer_name: String,
    stopped: AtomicBool,
}

impl RedisStreamsBroker {
    pub fn new(client: RedisClient, subscription: Subscription, config: &RedisStreamsConfig) -> Self {
        let stream_key = stream_key(&config.stream_prefix, &subscription.topic);
        Self {
            client,
            subscription,
            stream_key,
            consumer_name: config.consumer_name.clone(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            anyhow::bail!("Redis Streams broker client is stopped");
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for RedisStreamsBroker {
    async fn start(&self) -> Result<()> {
        let mut client = self.client.clone();
        let created = client
            .xgroup_create_mkstream(&self.stream_key, &self.subscription.consumer_group, "$")
            .await
            .context("Failed to create consumer group")?;

        info!(
            stream = %self.stream_key,
            group = %self.subscription.consumer_group,
            consumer = %self.consumer_name,
            created = created,
            "Redis Streams consumer group ready"
        );
        Ok(())
    }

    async fn receive(&self, max_count: u32, invisibility: Duration) -> Result<Vec<MessageView>> {
        self.ensure_running()?;

        let mut client = self.client.clone();
        let group = self.subscription.consumer_group.as_str();
        let max = max_count.max(1) as usize;
        let min_idle_ms = invisibility.as_millis() as u64;

        // Redeliveries first: entries whose invisibility window elapsed without an ack
        let (_, claimed) = client
            .xautoclaim(&self.stream_key, group, &self.consumer_name, min_idle_ms, "0-0", max)
            .await
            .context("XAUTOCLAIM failed")?;

        let mut views = Vec::with_capacity(max);
        for entry in claimed {
            let attempts = client
                .xpending_times_delivered(&self.stream_key, group, &entry.id)
                .await
                .context("XPENDING failed")?
                .unwrap_or(1);
            views.push(decode_entry(&self.subscription.topic, entry, attempts as u32));
        }

        if views.len() < max {
            // No BLOCK: the receive loop pauses on an empty batch itself
            let fresh = client
                .xreadgroup(
                    &self.stream_key,
                    group,
                    &self.consumer_name,
                    max - views.len(),
                    None,
                )
                .await
                .context("XREADGROUP failed")?;
            views.extend(
                fresh
                    .into_iter()
                    .map(|entry| decode_entry(&self.subscription.topic, entry, 1)),
            );
        }

        let stream_key = self.stream_key.as_str();
        let matched = keep_matching(views, &self.subscription.filter, |receipts| async move {
            let ids: Vec<&str> = receipts.iter().map(String::as_str).collect();
            client
                .xack(stream_key, group, &ids)
                .await
                .map(|_| ())
                .context("XACK of filtered entries failed")
        })
        .await;

        Ok(matched)
    }

    async fn ack(&self, message: &MessageView) -> Result<()> {
        self.ensure_running()?;

        let mut client = self.client.clone();
        let acked = client
            .xack(
                &self.stream_key,
                &self.subscription.consumer_group,
                &[message.receipt.as_str()],
            )
            .await
            .context("XACK failed")?;

        if acked == 0 {
            // Already acked, or reclaimed and acked by another consumer
            warn!(
                message_id = %message.message_id,
                stream = %self.stream_key,
                "XACK matched no pending entry"
            );
        }
        Ok(())
    }

    async fn graceful_stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        info!(
            stream = %self.stream_key,
            consumer = %self.consumer_name,
            "Redis Streams broker client stopped"
        );
        Ok(())
    }
}

/// Split off entries the filter rejects and ack them with `ack_skipped`
///
/// A failed ack is only logged: the matching entries are already claimed by
/// this consumer and must still reach the handler.
async fn keep_matching<F, Fut>(
    views: Vec<MessageView>,
    filter: &FilterExpression,
    ack_skipped: F,
) -> Vec<MessageView>
where
    F: FnOnce(Vec<String>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let (matched, skipped): (Vec<_>, Vec<_>) = views
        .into_iter()
        .partition(|view| filter.matches(view.tag.as_deref()));

    if skipped.is_empty() {
        return matched;
    }

    let count = skipped.len();
    let receipts = skipped.into_iter().map(|view| view.receipt).collect();
    match ack_skipped(receipts).await {
        Ok(()) => debug!(filter = %filter, count = count, "Skipped entries not matching the tag filter"),
        Err(e) => warn!(
            filter = %filter,
            count = count,
            error = %e,
            "Failed to ack entries not matching the tag filter, they will be reclaimed"
        ),
    }
    matched
}

fn decode_entry(default_topic: &str, entry: StreamEntryBinary, delivery_attempt: u32) -> MessageView {
    let topic = entry
        .field_str(FIELD_TOPIC)
        .unwrap_or_else(|| default_topic.to_string());
    let tag = entry.field_str(FIELD_TAG).filter(|t| !t.is_empty());

    let keys: Vec<String> = entry
        .fields
        .get(FIELD_KEYS)
        .and_then(|raw| serde_json::from_slice(raw).ok())
        .unwrap_or_default();

    let properties: HashMap<String, String> = match entry.fields.get(FIELD_PROPERTIES) {
        Some(raw) => serde_json::from_slice(raw).unwrap_or_else(|e| {
            warn!(error = %e, entry_id = %entry.id, "Malformed properties field, ignoring");
            HashMap::new()
        }),
        None => HashMap::new(),
    };

    let body = entry
        .fields
        .get(FIELD_BODY)
        .map(|b| Bytes::copy_from_slice(b))
        .unwrap_or_default();

    MessageView {
        message_id: entry.id.clone(),
        receipt: entry.id,
        topic,
        tag,
        keys,
        body,
        properties,
        delivery_attempt: delivery_attempt.max(1),
    }
}

/// Publish a message onto a stream with the wire fields above
///
/// Returns the broker-assigned message ID.
pub async fn publish(
    client: &mut RedisClient,
    stream_key: &str,
    max_len: usize,
    message: &OutboundMessage,
) -> Result<String> {
    let keys = serde_json::to_vec(&message.keys).context("Failed to encode message keys")?;
    let properties =
        serde_json::to_vec(&message.properties).context("Failed to encode message properties")?;
    let tag = message.tag.as_deref().unwrap_or_default();

    let fields: [(&str, &[u8]); 5] = [
        (FIELD_TOPIC, message.topic.as_bytes()),
        (FIELD_TAG, tag.as_bytes()),
        (FIELD_KEYS, keys.as_slice()),
        (FIELD_BODY, message.body.as_ref()),
        (FIELD_PROPERTIES, properties.as_slice()),
    ];

    let id = client
        .xadd_binary(stream_key, max_len, &fields)
        .await
        .context("XADD failed")?;

    debug!(stream = %stream_key, message_id = %id, "Published message");
    Ok(id)
}
