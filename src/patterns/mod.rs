// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tutorial Patterns
//!
//! The classic RabbitMQ tutorial programs as library functions: a hello world
//! queue, a durable work queue, and fanout, direct and topic log routing. The
//! producers take a [`crate::publisher::Publisher`], the consumers are
//! [`crate::handler::ConsumerHandler`]s run by a [`crate::dispatcher::Dispatcher`].

mod logs;
mod printer;
mod work_queue;

pub use logs::{
    emit_log, emit_log_direct, emit_log_topic, receive_logs, subscribe_direct, subscribe_logs,
    subscribe_topic, Severity, DEFAULT_TOPIC_KEY, DIRECT_LOGS_EXCHANGE, LOGS_EXCHANGE,
    TOPIC_LOGS_EXCHANGE,
};
pub use printer::{LogPrinter, PrintStyle};
pub use work_queue::{
    receive_hello, run_worker, send_hello, new_task, task_queue, TaskWorker, DEFAULT_MESSAGE,
    HELLO_QUEUE, TASK_QUEUE,
};
