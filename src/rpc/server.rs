// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Consumes `rpc_queue` one request at a time and publishes each answer to the
//! requester's `reply_to` queue under the request's correlation id.

use super::{fibonacci, RpcFault};
use crate::{
    broker::{Broker, ConsumeOptions},
    dispatcher::Dispatcher,
    errors::AmqpError,
    exchange::DEFAULT_EXCHANGE,
    handler::ConsumerHandler,
    message::{Delivery, Message, MessageProperties, JSON_CONTENT_TYPE, TEXT_CONTENT_TYPE},
    publisher::Publisher,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Lifetime of a reply nobody consumes.
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(60);

/// Answers Fibonacci requests.
///
/// The request body is a decimal `n`; the reply body is `fib(n)` as decimal text.
/// Requests that cannot be answered get a JSON [`RpcFault`] reply instead.
#[derive(Clone)]
pub struct FibonacciServer {
    publisher: Publisher,
    reply_ttl: Option<Duration>,
}

impl FibonacciServer {
    pub fn new(publisher: Publisher) -> Self {
        FibonacciServer {
            publisher,
            reply_ttl: Some(DEFAULT_REPLY_TTL),
        }
    }

    /// Expiration set on replies, `None` to keep them until consumed.
    pub fn with_reply_ttl(mut self, reply_ttl: Option<Duration>) -> Self {
        self.reply_ttl = reply_ttl;
        self
    }

    /// Declares `queue` and serves requests from it, one at a time, until the
    /// session ends.
    pub async fn serve(self, broker: Arc<dyn Broker>, queue: &str) -> Result<(), AmqpError> {
        broker.declare_queue(&QueueDefinition::new(queue)).await?;
        debug!(queue, "awaiting rpc requests");

        Dispatcher::new(broker)
            .register(queue, ConsumeOptions::default().prefetch(1), Arc::new(self))
            .consume_blocking()
            .await
    }

    fn answer(&self, request: &str) -> Result<Message, AmqpError> {
        let computed = request
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid input `{request}`, expected a non-negative integer"))
            .and_then(|n| {
                info!(n, "fib requested");
                fibonacci(n).map_err(|err| err.to_string())
            });

        let (body, content_type) = match computed {
            Ok(value) => (value.to_string().into_bytes(), TEXT_CONTENT_TYPE),
            Err(message) => {
                warn!(request, fault = message, "replying with fault");
                let body = serde_json::to_vec(&RpcFault { message }).map_err(|err| {
                    AmqpError::ConsumerError(format!("encoding fault: {err}"))
                })?;
                (body, JSON_CONTENT_TYPE)
            }
        };

        let mut props = MessageProperties::default().with_content_type(content_type);
        props.expiration = self.reply_ttl;
        Ok(Message::new(body).with_properties(props))
    }
}

#[async_trait]
impl ConsumerHandler for FibonacciServer {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        let props = &delivery.message.properties;
        let (Some(reply_to), Some(correlation_id)) =
            (props.reply_to.as_deref(), props.correlation_id.as_deref())
        else {
            warn!(
                delivery_tag = delivery.delivery_tag,
                "request without reply_to or correlation_id, nothing to answer"
            );
            return Ok(());
        };

        let mut reply = self.answer(&delivery.message.text())?;
        reply.properties.correlation_id = Some(correlation_id.to_owned());

        self.publisher
            .publish(ctx, DEFAULT_EXCHANGE, reply_to, reply)
            .await
    }
}
