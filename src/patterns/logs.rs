// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Routing
//!
//! Publish/subscribe over the `logs` (fanout), `direct_logs` (severity) and
//! `topic_logs` (`<facility>.<severity>`) exchanges. Every subscriber gets its own
//! exclusive, broker-named queue, bound once per requested key.

use crate::{
    broker::{Broker, ConsumeOptions},
    dispatcher::Dispatcher,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    message::Message,
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use opentelemetry::Context;
use std::{fmt, sync::Arc};
use tracing::debug;

pub const LOGS_EXCHANGE: &str = "logs";
pub const DIRECT_LOGS_EXCHANGE: &str = "direct_logs";
pub const TOPIC_LOGS_EXCHANGE: &str = "topic_logs";

/// Routing key used by the topic emitter when none is given.
pub const DEFAULT_TOPIC_KEY: &str = "anonymous.info";

/// Severity of a log line, the routing key of the direct log exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Parses a severity, falling back to [`Severity::Info`] for anything unknown.
    pub fn parse_lenient(value: &str) -> Severity {
        match value {
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            "critical" => Severity::Critical,
            _ => Severity::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn logs_exchange() -> ExchangeDefinition {
    ExchangeDefinition::new(LOGS_EXCHANGE).fanout()
}

fn direct_logs_exchange() -> ExchangeDefinition {
    ExchangeDefinition::new(DIRECT_LOGS_EXCHANGE).direct()
}

fn topic_logs_exchange() -> ExchangeDefinition {
    ExchangeDefinition::new(TOPIC_LOGS_EXCHANGE).topic()
}

async fn emit(
    publisher: &Publisher,
    exchange: ExchangeDefinition,
    routing_key: &str,
    message: &str,
) -> Result<(), AmqpError> {
    publisher.broker().declare_exchange(&exchange).await?;
    publisher
        .publish(&Context::current(), exchange.name(), routing_key, Message::new(message))
        .await?;

    debug!(exchange = exchange.name(), routing_key, "log emitted");
    Ok(())
}

/// Broadcasts `message` to every subscriber of the `logs` exchange.
pub async fn emit_log(publisher: &Publisher, message: &str) -> Result<(), AmqpError> {
    emit(publisher, logs_exchange(), "", message).await
}

/// Publishes `message` on the `direct_logs` exchange with the severity as key.
pub async fn emit_log_direct(
    publisher: &Publisher,
    severity: Severity,
    message: &str,
) -> Result<(), AmqpError> {
    emit(publisher, direct_logs_exchange(), severity.as_str(), message).await
}

/// Publishes `message` on the `topic_logs` exchange, `<facility>.<severity>` keys
/// by convention.
pub async fn emit_log_topic(
    publisher: &Publisher,
    routing_key: &str,
    message: &str,
) -> Result<(), AmqpError> {
    emit(publisher, topic_logs_exchange(), routing_key, message).await
}

/// Declares `exchange` and a fresh exclusive queue bound to it once per key.
///
/// # Returns
/// The generated queue name.
async fn subscribe(
    broker: &dyn Broker,
    exchange: ExchangeDefinition,
    binding_keys: &[&str],
) -> Result<String, AmqpError> {
    if binding_keys.is_empty() {
        return Err(AmqpError::MissingBindingKeys(exchange.name().to_owned()));
    }

    let queue = Topology::new()
        .exchange(exchange.clone())
        .queue(QueueDefinition::ephemeral())
        .install(broker)
        .await?
        .into_iter()
        .next()
        .ok_or(AmqpError::InternalError)?;

    binding_keys
        .iter()
        .fold(Topology::new(), |topology, key| {
            topology.queue_binding(QueueBinding::new(&queue).exchange(exchange.name()).routing_key(key))
        })
        .install(broker)
        .await?;
    debug!(queue, exchange = exchange.name(), keys = ?binding_keys, "subscribed");

    Ok(queue)
}

/// Subscribes a new exclusive queue to the `logs` fanout exchange.
pub async fn subscribe_logs(broker: &dyn Broker) -> Result<String, AmqpError> {
    subscribe(broker, logs_exchange(), &[""]).await
}

/// Subscribes a new exclusive queue to the given severities. Fails when
/// `severities` is empty.
pub async fn subscribe_direct(broker: &dyn Broker, severities: &[&str]) -> Result<String, AmqpError> {
    subscribe(broker, direct_logs_exchange(), severities).await
}

/// Subscribes a new exclusive queue to the given topic patterns. Fails when
/// `binding_keys` is empty.
pub async fn subscribe_topic(broker: &dyn Broker, binding_keys: &[&str]) -> Result<String, AmqpError> {
    subscribe(broker, topic_logs_exchange(), binding_keys).await
}

/// Consumes a subscription queue with automatic acknowledgment.
pub async fn receive_logs(
    broker: Arc<dyn Broker>,
    queue: &str,
    handler: Arc<dyn ConsumerHandler>,
) -> Result<(), AmqpError> {
    debug!(queue, "waiting for logs");

    Dispatcher::new(broker)
        .register(queue, ConsumeOptions::default().auto_ack(), handler)
        .consume_blocking()
        .await
}
