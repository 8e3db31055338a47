// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Printer

use crate::{errors::AmqpError, handler::ConsumerHandler, message::Delivery};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    io::{self, Write},
    sync::{Mutex, PoisonError},
};

/// Line format of a [`LogPrinter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStyle {
    /// ` [x] <body>`
    Body,
    /// ` [x] <routing key>:<body>`
    RoutingKey,
}

/// Writes one line per delivery.
pub struct LogPrinter<W> {
    out: Mutex<W>,
    style: PrintStyle,
}

impl LogPrinter<io::Stdout> {
    pub fn stdout(style: PrintStyle) -> Self {
        LogPrinter::new(io::stdout(), style)
    }
}

impl<W: Write + Send> LogPrinter<W> {
    pub fn new(out: W, style: PrintStyle) -> Self {
        LogPrinter {
            out: Mutex::new(out),
            style,
        }
    }

    fn line(&self, delivery: &Delivery) -> String {
        let body = delivery.message.text();
        match self.style {
            PrintStyle::Body => format!(" [x] {body}"),
            PrintStyle::RoutingKey => format!(" [x] {}:{body}", delivery.routing_key),
        }
    }
}

#[async_trait]
impl<W: Write + Send> ConsumerHandler for LogPrinter<W> {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        let line = self.line(delivery);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }
}
