// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Opens the connection to RabbitMQ described by [`Configs`] and a channel on it.

use crate::{configs::Configs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// The connection is named after `cfg.app.name`, which is how it shows up in the
/// management UI.
///
/// # Returns
/// The connection and its channel, or [`AmqpError::ConnectionError`] /
/// [`AmqpError::ChannelError`]. There is no retry.
pub async fn new_amqp_channel(cfg: &Configs) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(host = cfg.rabbitmq.host, port = cfg.rabbitmq.port, "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = Connection::connect(&cfg.rabbitmq.uri(), options)
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError
        })?;
    debug!("amqp connected");

    match conn.create_channel().await {
        Ok(c) => {
            debug!(channel = c.id(), "channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
