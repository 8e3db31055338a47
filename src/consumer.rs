// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module implements the handling of a single delivery: start a trace span,
//! run the registered handler, then acknowledge on success or reject on failure.
//! A failure of the broker link (for example a reply that could not be published)
//! puts the delivery back on its queue; any other failure drops it. Auto-ack
//! consumers skip the settlement step.

use crate::{broker::Broker, dispatcher::DispatcherDefinition, errors::AmqpError, message::Delivery, otel};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Consumes and processes a delivery.
///
/// This function:
/// 1. Creates a trace span from the message headers
/// 2. Runs the handler registered for the queue
/// 3. Acks the delivery on success
/// 4. Nacks it on failure, requeueing only when the failure is transient
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    def: &DispatcherDefinition,
    broker: &dyn Broker,
) -> Result<(), AmqpError> {
    let props = &delivery.message.properties;
    let span_name = props.kind.as_deref().unwrap_or(&def.queue);
    let (ctx, mut span) = otel::new_span(props, tracer, span_name);

    debug!(
        "received: {} - exchange: {} - redelivered: {}",
        delivery.routing_key, delivery.exchange, delivery.redelivered,
    );

    let result = def.handler.exec(&ctx, delivery).await;

    if def.options.auto_ack {
        return match result {
            Ok(_) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });
                Err(err)
            }
        };
    }

    if result.is_ok() {
        debug!("message successfully processed");
        return match broker.ack(delivery.delivery_tag).await {
            Err(e) => {
                error!("error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        };
    }

    let requeue = match &result {
        Err(err) => {
            warn!(error = err.to_string(), requeue = err.is_transient(), "error whiling handling msg, rejecting");
            span.record_error(err);
            err.is_transient()
        }
        Ok(_) => false,
    };

    match broker.nack(delivery.delivery_tag, requeue).await {
        Ok(_) => {
            span.set_status(Status::Error {
                description: Cow::from("msg rejected"),
            });
            Ok(())
        }
        Err(e) => {
            error!("error whiling nack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
            Err(AmqpError::NackMessageError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{ConsumeOptions, MockBroker},
        handler::MockConsumerHandler,
        message::Message,
    };
    use opentelemetry::global;
    use std::sync::Arc;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            consumer_tag: "ctag-1".to_owned(),
            exchange: String::new(),
            routing_key: "task_queue".to_owned(),
            redelivered: false,
            message: Message::new("work..."),
        }
    }

    fn definition(handler: MockConsumerHandler, options: ConsumeOptions) -> DispatcherDefinition {
        DispatcherDefinition {
            queue: "task_queue".to_owned(),
            options,
            handler: Arc::new(handler),
        }
    }

    #[tokio::test]
    async fn acks_after_successful_handling() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(1).returning(|_, _| Ok(()));
        let mut broker = MockBroker::new();
        broker.expect_ack().withf(|tag| *tag == 7).times(1).returning(|_| Ok(()));
        broker.expect_nack().never();

        let def = definition(handler, ConsumeOptions::default());
        consume(&global::tracer("test"), &delivery(7), &def, &broker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_without_requeue_on_handler_failure() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::ConsumerError("boom".to_owned())));
        let mut broker = MockBroker::new();
        broker.expect_ack().never();
        broker
            .expect_nack()
            .withf(|tag, requeue| *tag == 3 && !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let def = definition(handler, ConsumeOptions::default());
        consume(&global::tracer("test"), &delivery(3), &def, &broker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn requeues_when_handler_fails_on_broker_link() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::PublishingError));
        let mut broker = MockBroker::new();
        broker.expect_ack().never();
        broker
            .expect_nack()
            .withf(|tag, requeue| *tag == 4 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let def = definition(handler, ConsumeOptions::default());
        consume(&global::tracer("test"), &delivery(4), &def, &broker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auto_ack_consumers_are_not_settled() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(|_, _| Ok(()));
        let mut broker = MockBroker::new();
        broker.expect_ack().never();
        broker.expect_nack().never();

        let def = definition(handler, ConsumeOptions::default().auto_ack());
        consume(&global::tracer("test"), &delivery(1), &def, &broker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ack_failure_is_reported() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(|_, _| Ok(()));
        let mut broker = MockBroker::new();
        broker
            .expect_ack()
            .returning(|tag| Err(AmqpError::UnknownDeliveryTag(tag)));

        let def = definition(handler, ConsumeOptions::default());
        let result = consume(&global::tracer("test"), &delivery(9), &def, &broker).await;

        assert_eq!(result, Err(AmqpError::AckMessageError));
    }
}
