// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The operations the messaging patterns need from a message broker session:
//! declare, bind, publish, consume and acknowledge. Two implementations exist:
//! [`crate::memory::MemorySession`], an in-process reference broker, and
//! [`crate::amqp::AmqpBroker`], backed by a RabbitMQ channel.
//!
//! A `Broker` value is one session (connection + channel). Exclusive queues,
//! consumers and outstanding delivery tags belong to the session that created them.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use std::fmt;

/// Default number of unacknowledged deliveries a consumer may hold.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Per-consumer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding to this consumer, `0` means
    /// unlimited. Ignored for auto-ack consumers.
    pub prefetch: u16,
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub auto_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            prefetch: DEFAULT_PREFETCH,
            auto_ack: false,
        }
    }
}

impl ConsumeOptions {
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }
}

/// A consumer subscribed to one queue.
///
/// The stream ends when the consumer is cancelled or its session ends.
pub struct Consumer {
    tag: String,
    queue: String,
    stream: BoxStream<'static, Result<Delivery, AmqpError>>,
}

impl Consumer {
    pub fn new(
        tag: String,
        queue: String,
        stream: BoxStream<'static, Result<Delivery, AmqpError>>,
    ) -> Self {
        Consumer { tag, queue, stream }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next delivery. `None` once the consumer is gone.
    pub async fn next_delivery(&mut self) -> Option<Result<Delivery, AmqpError>> {
        self.stream.next().await
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .finish()
    }
}

/// A broker session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, generated when the definition's
    /// name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange with a binding pattern.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Deletes a queue together with its bindings and pending messages.
    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    /// Publishes a message. Unroutable messages are dropped silently.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer on a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, AmqpError>;

    /// Acknowledges a delivery received on this session.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a delivery, optionally putting it back on its queue.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Ends the session. Unacked deliveries become eligible for redelivery and
    /// exclusive queues are deleted.
    async fn close(&self) -> Result<(), AmqpError>;
}
