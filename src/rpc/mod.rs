// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply over Queues
//!
//! A synchronous looking call built on asynchronous delivery. The client publishes
//! a request to a well known queue with two properties: `reply_to`, naming its
//! private exclusive reply queue, and `correlation_id`, a fresh token. The server
//! publishes the result to `reply_to` with the same `correlation_id`, and the
//! client resolves the pending call whose token matches.

mod client;
mod fibonacci;
mod server;

pub use client::RpcClient;
pub use fibonacci::{fibonacci, FibonacciError, MAX_FIBONACCI_INPUT};
pub use server::FibonacciServer;

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Queue the RPC server consumes requests from.
pub const RPC_QUEUE: &str = "rpc_queue";

/// Body of a reply reporting a failed request, sent as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub message: String,
}

/// Errors of an RPC call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No matching reply arrived before the deadline
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The server could not process the request
    #[error("remote failure `{0}`")]
    Remote(String),

    /// The reply body could not be decoded
    #[error("invalid response `{0}`")]
    InvalidResponse(String),

    /// The reply consumer ended before the call resolved
    #[error("reply channel closed")]
    ReplyChannelClosed,

    /// Broker failure while setting up or sending the call
    #[error(transparent)]
    Amqp(#[from] AmqpError),
}
