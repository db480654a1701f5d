// ============================================================================
// Message Model
// ============================================================================
//
// Broker-agnostic representation of a message. Inbound messages are built
// from a broker `MessageView`; outbound messages (the dead-letter path) are
// produced with `to_outbound()`.
//
// `user_id` and `business_key` travel as the reserved properties `userId`
// and `businessKey` because the broker has no first-class field for them.
//
// ============================================================================

use crate::broker::MessageView;
use bytes::Bytes;
use std::collections::HashMap;

/// Reserved property carrying `Message::user_id`
pub const PROPERTY_USER_ID: &str = "userId";

/// Reserved property carrying `Message::business_key`
pub const PROPERTY_BUSINESS_KEY: &str = "businessKey";

/// Immutable message handed to handlers and hooks
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    topic: String,
    tags: String,
    keys: String,
    user_id: String,
    business_key: String,
    message_id: String,
    body: Bytes,
    properties: HashMap<String, String>,
}

impl Message {
    pub fn builder(topic: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            message: Message {
                topic: topic.into(),
                ..Default::default()
            },
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tags(&self) -> &str {
        &self.tags
    }

    /// Comma-joined message keys
    pub fn keys(&self) -> &str {
        &self.keys
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn business_key(&self) -> &str {
        &self.business_key
    }

    /// Broker-assigned, opaque identifier
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Map to the outbound wire shape
    ///
    /// Only the first comma-separated key is carried; `userId` and
    /// `businessKey` are injected into the properties when non-empty.
    pub fn to_outbound(&self) -> OutboundMessage {
        let mut properties = self.properties.clone();
        if !self.user_id.is_empty() {
            properties.insert(PROPERTY_USER_ID.to_string(), self.user_id.clone());
        }
        if !self.business_key.is_empty() {
            properties.insert(PROPERTY_BUSINESS_KEY.to_string(), self.business_key.clone());
        }

        let keys = self
            .keys
            .split(',')
            .map(str::trim)
            .find(|k| !k.is_empty())
            .map(|k| vec![k.to_string()])
            .unwrap_or_default();

        OutboundMessage {
            topic: self.topic.clone(),
            tag: (!self.tags.is_empty()).then(|| self.tags.clone()),
            keys,
            body: self.body.clone(),
            properties,
        }
    }
}

impl From<&MessageView> for Message {
    fn from(view: &MessageView) -> Self {
        let properties = view.properties.clone();
        let user_id = properties.get(PROPERTY_USER_ID).cloned().unwrap_or_default();
        let business_key = properties
            .get(PROPERTY_BUSINESS_KEY)
            .cloned()
            .unwrap_or_default();

        Message {
            topic: view.topic.clone(),
            tags: view.tag.clone().unwrap_or_default(),
            keys: view.keys.join(","),
            user_id,
            business_key,
            message_id: view.message_id.clone(),
            body: view.body.clone(),
            properties,
        }
    }
}

/// Builder for `Message`, mainly for producers and tests
#[derive(Debug)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn tags(mut self, tags: impl Into<String>) -> Self {
        self.message.tags = tags.into();
        self
    }

    pub fn keys(mut self, keys: impl Into<String>) -> Self {
        self.message.keys = keys.into();
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.message.user_id = user_id.into();
        self
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.message.business_key = business_key.into();
        self
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message.message_id = message_id.into();
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.message.body = body.into();
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.properties.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

/// Message in the shape a broker accepts for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub tag: Option<String>,
    pub keys: Vec<String>,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}
