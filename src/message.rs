// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Broker independent representation of a message, its properties and a delivery
//! handed to a consumer. Backends convert from/to their wire types at the edge.

use std::{collections::BTreeMap, time::Duration};

/// Maximum size in bytes of a routing key.
pub const MAX_ROUTING_KEY_LEN: usize = 255;

/// Default content type for plain text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Persistence flag of a message.
///
/// Values follow AMQP 0-9-1: `1` is transient, `2` is persistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    /// Any value other than `2` is transient.
    pub fn from_u8(value: u8) -> Self {
        if value == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Properties carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: DeliveryMode,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    /// Per-message time to live.
    pub expiration: Option<Duration>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::Persistent)
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }
}

/// An opaque payload plus its properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Lossy UTF-8 view of the body, for logging and text protocols.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A message handed to a consumer.
///
/// The `delivery_tag` identifies the delivery for [`crate::broker::Broker::ack`] and
/// [`crate::broker::Broker::nack`] on the session that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_wire_values() {
        assert_eq!(DeliveryMode::Persistent.as_u8(), 2);
        assert_eq!(DeliveryMode::from_u8(2), DeliveryMode::Persistent);
        assert_eq!(DeliveryMode::from_u8(1), DeliveryMode::Transient);
        assert_eq!(DeliveryMode::from_u8(0), DeliveryMode::Transient);
    }

    #[test]
    fn properties_builder() {
        let props = MessageProperties::default()
            .persistent()
            .with_reply_to("amq.gen-1")
            .with_correlation_id("abc")
            .with_header("traceparent", "00-1");

        assert!(props.is_persistent());
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.headers.get("traceparent").map(String::as_str), Some("00-1"));
    }
}
