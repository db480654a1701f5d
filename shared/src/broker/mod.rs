// ============================================================================
// Broker Seam
// ============================================================================
//
// The consumer engine talks to the broker only through these traits.
// `BrokerConnector` builds a client for a subscription (called from
// `start()`); the returned `BrokerClient` is owned by the lifecycle manager
// and used only by the receive loop.
//
// Contract expected from a client:
// - `receive` hides every returned message for `invisibility`; a message that
//   is not acked within that window becomes deliverable again with its
//   `delivery_attempt` incremented.
// - `ack` removes the message for good.
//
// ============================================================================

pub mod redis_streams;

use crate::filter::FilterExpression;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use redis_streams::{RedisStreamsBroker, RedisStreamsConnector};

/// What a consumer subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub consumer_group: String,
    pub filter: FilterExpression,
}

/// A message as received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    /// Broker-assigned message ID
    pub message_id: String,
    /// Handle used to acknowledge this delivery
    pub receipt: String,
    pub topic: String,
    pub tag: Option<String>,
    pub keys: Vec<String>,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    /// How many times the broker has handed this message out (1 = first delivery)
    pub delivery_attempt: u32,
}

/// Connected broker client for a single subscription
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    /// Pull up to `max_count` messages, hiding them for `invisibility`
    async fn receive(
        &self,
        max_count: u32,
        invisibility: Duration,
    ) -> anyhow::Result<Vec<MessageView>>;

    async fn ack(&self, message: &MessageView) -> anyhow::Result<()>;

    /// Let in-flight calls finish and refuse new ones
    async fn graceful_stop(&self) -> anyhow::Result<()>;
}

/// Factory for broker clients
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, subscription: &Subscription) -> anyhow::Result<Arc<dyn BrokerClient>>;
}
