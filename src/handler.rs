// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The capability a consumer plugs into the [`crate::dispatcher::Dispatcher`]: one
//! implementation per use case (log printer, task worker, RPC server), chosen at
//! setup time.

use crate::{errors::AmqpError, message::Delivery};
use async_trait::async_trait;
use opentelemetry::Context;

/// Processes one delivery.
///
/// Returning `Ok` acknowledges the delivery, returning `Err` rejects it without
/// requeueing. Deliveries are at-least-once, so implementations must tolerate
/// seeing the same message twice.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}
