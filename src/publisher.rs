// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides functionality for publishing messages to exchanges. Every
//! message leaves with a unique message id, a content type, and the OpenTelemetry
//! trace context of the caller in its headers.

use crate::{
    broker::Broker,
    errors::AmqpError,
    message::{Message, TEXT_CONTENT_TYPE},
    otel,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Publishes messages through a broker session.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Publisher {
        Publisher { broker }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publishes a message to `exchange` with the given routing key.
    ///
    /// Missing message id and content type are filled in; properties already set by
    /// the caller (`reply_to`, `correlation_id`, delivery mode...) are kept as is.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        mut message: Message,
    ) -> Result<(), AmqpError> {
        let props = &mut message.properties;
        otel::inject_context(ctx, props);

        if props.message_id.is_none() {
            props.message_id = Some(Uuid::new_v4().to_string());
        }
        if props.content_type.is_none() {
            props.content_type = Some(TEXT_CONTENT_TYPE.to_owned());
        }

        self.broker
            .publish(exchange, routing_key, message)
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBroker,
        message::{MessageProperties, JSON_CONTENT_TYPE},
    };

    #[tokio::test]
    async fn fills_in_message_id_and_content_type() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|exchange, key, msg| {
                exchange == "logs"
                    && key.is_empty()
                    && msg.properties.message_id.is_some()
                    && msg.properties.content_type.as_deref() == Some(TEXT_CONTENT_TYPE)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        Publisher::new(Arc::new(broker))
            .publish(&Context::new(), "logs", "", Message::new("hi"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_caller_properties() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|_, key, msg| {
                key == "rpc_queue"
                    && msg.properties.correlation_id.as_deref() == Some("c-1")
                    && msg.properties.reply_to.as_deref() == Some("amq.gen-x")
                    && msg.properties.message_id.as_deref() == Some("m-1")
                    && msg.properties.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
                    && msg.properties.is_persistent()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let props = MessageProperties::default()
            .persistent()
            .with_correlation_id("c-1")
            .with_reply_to("amq.gen-x")
            .with_message_id("m-1")
            .with_content_type(JSON_CONTENT_TYPE);

        Publisher::new(Arc::new(broker))
            .publish(&Context::new(), "", "rpc_queue", Message::new("10").with_properties(props))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn propagates_broker_errors() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .returning(|exchange, _, _| Err(AmqpError::ExchangeNotFound(exchange.to_owned())));

        let result = Publisher::new(Arc::new(broker))
            .publish(&Context::new(), "nope", "", Message::new("x"))
            .await;

        assert_eq!(result, Err(AmqpError::ExchangeNotFound("nope".to_owned())));
    }
}
