// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Backend
//!
//! [`Broker`] implementation over a `lapin` channel. Message properties are mapped
//! to their AMQP 0-9-1 counterparts: `kind` is the `type` property, `expiration`
//! is sent in milliseconds, headers are sent as long strings. Queue TTL and max
//! length become the `x-message-ttl` / `x-max-length` arguments.

use crate::{
    broker::{Broker, ConsumeOptions, Consumer},
    channel::new_amqp_channel,
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, DeliveryMode, Message, MessageProperties, MAX_ROUTING_KEY_LEN},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

const MESSAGE_TTL_ARG: &str = "x-message-ttl";
const MAX_LENGTH_ARG: &str = "x-max-length";

/// A RabbitMQ session: one connection and one channel.
pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpBroker {
    pub fn new(connection: Arc<Connection>, channel: Arc<Channel>) -> Self {
        AmqpBroker {
            connection,
            channel,
        }
    }

    /// Connects to the broker described by `cfg`.
    pub async fn connect(cfg: &Configs) -> Result<Self, AmqpError> {
        let (connection, channel) = new_amqp_channel(cfg).await?;
        Ok(AmqpBroker::new(connection, channel))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} - exchange: {} - key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the queue");
                AmqpError::DeleteQueueError(name.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), AmqpError> {
        // the broker would close the channel
        if routing_key.len() > MAX_ROUTING_KEY_LEN {
            debug!(exchange, len = routing_key.len(), "routing key too long, message dropped");
            return Ok(());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, AmqpError> {
        if !options.auto_ack {
            self.channel
                .basic_qos(options.prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to configure qos");
                    AmqpError::QoSDeclarationError(queue.to_owned())
                })?;
        }

        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError
            })?;

        let consumer_tag = tag.clone();
        let deliveries = consumer.map(move |result| match result {
            Ok(delivery) => Ok(to_delivery(&consumer_tag, delivery)),
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        });

        Ok(Consumer::new(tag, queue.to_owned(), deliveries.boxed()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the channel");
            AmqpError::ChannelError
        })?;
        self.connection.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the connection");
            AmqpError::ConnectionError
        })
    }
}

fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::<ShortString, AMQPValue>::new();
    if let Some(ttl) = def.ttl {
        let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
        args.insert(ShortString::from(MESSAGE_TTL_ARG), AMQPValue::LongUInt(millis));
    }
    if let Some(max) = def.max_length {
        let max = i64::try_from(max).unwrap_or(i64::MAX);
        args.insert(ShortString::from(MAX_LENGTH_ARG), AMQPValue::LongLongInt(max));
    }
    FieldTable::from(args)
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(props.delivery_mode.as_u8());

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(correlation_id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(message_id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(expiration) = props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }
    if !props.headers.is_empty() {
        let headers: BTreeMap<ShortString, AMQPValue> = props
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect();
        basic = basic.with_headers(FieldTable::from(headers));
    }

    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_owned());

    let headers = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                        AMQPValue::ShortString(s) => s.as_str().to_owned(),
                        _ => return None,
                    };
                    Some((key.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        delivery_mode: basic
            .delivery_mode()
            .map_or(DeliveryMode::Transient, DeliveryMode::from_u8),
        content_type: text(basic.content_type()),
        reply_to: text(basic.reply_to()),
        correlation_id: text(basic.correlation_id()),
        message_id: text(basic.message_id()),
        kind: text(basic.kind()),
        expiration: basic
            .expiration()
            .as_ref()
            .and_then(|millis| millis.as_str().parse().ok())
            .map(Duration::from_millis),
        headers,
    }
}

fn to_delivery(consumer_tag: &str, delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_owned(),
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        message: Message::new(delivery.data).with_properties(from_basic_properties(&delivery.properties)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_properties_survive_the_wire_mapping() {
        let props = MessageProperties::default()
            .persistent()
            .with_reply_to("amq.gen-abc")
            .with_correlation_id("7f1c")
            .with_kind("fib")
            .with_expiration(Duration::from_secs(60))
            .with_header("traceparent", "00-abc-01");

        let basic = to_basic_properties(&props);
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(basic.expiration().as_ref().map(ShortString::as_str), Some("60000"));

        assert_eq!(from_basic_properties(&basic), props);
    }

    #[test]
    fn unset_delivery_mode_is_transient() {
        let props = from_basic_properties(&BasicProperties::default());

        assert_eq!(props.delivery_mode, DeliveryMode::Transient);
        assert!(props.headers.is_empty());
        assert_eq!(props.expiration, None);
    }

    #[test]
    fn retention_limits_become_queue_arguments() {
        let def = QueueDefinition::new("replies")
            .ttl(Duration::from_millis(1500))
            .max_length(10);

        let args = queue_arguments(&def);
        assert_eq!(
            args.inner().get(MESSAGE_TTL_ARG),
            Some(&AMQPValue::LongUInt(1500))
        );
        assert_eq!(
            args.inner().get(MAX_LENGTH_ARG),
            Some(&AMQPValue::LongLongInt(10))
        );
        assert!(queue_arguments(&QueueDefinition::new("plain")).inner().is_empty());
    }
}
