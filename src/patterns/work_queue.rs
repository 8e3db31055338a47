// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Work Queues
//!
//! The `hello` queue and the durable `task_queue`. Consumers acknowledge a message
//! only after handling it, so work held by a consumer that dies is redelivered.

use crate::{
    broker::{Broker, ConsumeOptions},
    dispatcher::Dispatcher,
    errors::AmqpError,
    exchange::DEFAULT_EXCHANGE,
    handler::ConsumerHandler,
    message::{Delivery, Message, MessageProperties},
    publisher::Publisher,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::debug;

pub const HELLO_QUEUE: &str = "hello";
pub const TASK_QUEUE: &str = "task_queue";
pub const DEFAULT_MESSAGE: &str = "Hello World!";

/// The durable work queue shared by producers and workers.
pub fn task_queue() -> QueueDefinition {
    QueueDefinition::new(TASK_QUEUE).durable()
}

/// Sends `message` to the `hello` queue through the default exchange.
pub async fn send_hello(publisher: &Publisher, message: &str) -> Result<(), AmqpError> {
    publisher
        .broker()
        .declare_queue(&QueueDefinition::new(HELLO_QUEUE))
        .await?;
    publisher
        .publish(&Context::current(), DEFAULT_EXCHANGE, HELLO_QUEUE, Message::new(message))
        .await?;
    debug!(queue = HELLO_QUEUE, "message sent");
    Ok(())
}

/// Consumes the `hello` queue, acknowledging each message once `handler` is done
/// with it. A message whose consumer dies first goes back to the queue.
pub async fn receive_hello(
    broker: Arc<dyn Broker>,
    handler: Arc<dyn ConsumerHandler>,
) -> Result<(), AmqpError> {
    broker.declare_queue(&QueueDefinition::new(HELLO_QUEUE)).await?;
    debug!(queue = HELLO_QUEUE, "waiting for messages");

    Dispatcher::new(broker)
        .register(HELLO_QUEUE, ConsumeOptions::default(), handler)
        .consume_blocking()
        .await
}

/// Queues a task as a persistent message on the durable task queue.
pub async fn new_task(publisher: &Publisher, message: &str) -> Result<(), AmqpError> {
    publisher.broker().declare_queue(&task_queue()).await?;

    let msg = Message::new(message).with_properties(MessageProperties::default().persistent());
    publisher
        .publish(&Context::current(), DEFAULT_EXCHANGE, TASK_QUEUE, msg)
        .await?;
    debug!(queue = TASK_QUEUE, "task queued");
    Ok(())
}

/// Runs `worker` on the task queue, one unacknowledged task at a time.
pub async fn run_worker(broker: Arc<dyn Broker>, worker: Arc<dyn ConsumerHandler>) -> Result<(), AmqpError> {
    broker.declare_queue(&task_queue()).await?;
    debug!(queue = TASK_QUEUE, "waiting for tasks");

    Dispatcher::new(broker)
        .register(TASK_QUEUE, ConsumeOptions::default().prefetch(1), worker)
        .consume_blocking()
        .await
}

/// Simulates work: each `.` in the body costs one time unit.
pub struct TaskWorker<W> {
    out: Mutex<W>,
    unit: Duration,
}

impl TaskWorker<io::Stdout> {
    pub fn stdout() -> Self {
        TaskWorker::new(io::stdout())
    }
}

impl<W: Write + Send> TaskWorker<W> {
    pub fn new(out: W) -> Self {
        TaskWorker {
            out: Mutex::new(out),
            unit: Duration::from_secs(1),
        }
    }

    /// Time spent per dot, one second by default.
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    fn print(&self, line: &str) -> Result<(), AmqpError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }
}

/// Cost of a task, in time units.
pub(crate) fn task_weight(body: &str) -> u32 {
    body.chars()
        .filter(|c| *c == '.')
        .count()
        .try_into()
        .unwrap_or(u32::MAX)
}

#[async_trait]
impl<W: Write + Send> ConsumerHandler for TaskWorker<W> {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        let body = delivery.message.text();
        self.print(&format!(" [x] Received {body}"))?;

        let weight = task_weight(&body);
        debug!(weight, redelivered = delivery.redelivered, "working");
        tokio::time::sleep(self.unit.saturating_mul(weight)).await;

        self.print(" [x] Done")
    }
}
