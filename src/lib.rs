// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message;
pub mod patterns;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod rpc;
pub mod telemetry;
pub mod topology;
