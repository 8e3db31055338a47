// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Settings are read with the `config` crate: built-in defaults overridden by
//! environment variables, nested keys separated by `__`
//! (`RABBITMQ__HOST`, `RPC__TIMEOUT_MS`, `APP__NAME`...).

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub rpc: RpcConfigs,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    /// Reported to the broker as the connection name.
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// AMQP URI of the broker. The vhost is percent-encoded, so the default vhost
    /// `/` becomes `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfigs {
    /// Client side deadline of a call, no deadline when unset.
    pub timeout_ms: Option<u64>,
    /// Expiration of server replies, `0` keeps replies until consumed.
    pub reply_ttl_ms: u64,
}

impl Default for RpcConfigs {
    fn default() -> Self {
        RpcConfigs {
            timeout_ms: None,
            reply_ttl_ms: 60_000,
        }
    }
}

impl RpcConfigs {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn reply_ttl(&self) -> Option<Duration> {
        (self.reply_ttl_ms > 0).then(|| Duration::from_millis(self.reply_ttl_ms))
    }
}

impl Configs {
    /// Loads the configuration from the process environment.
    pub fn load() -> Result<Self, AmqpError> {
        Self::load_from(Environment::default())
    }

    /// Loads the configuration from an environment source.
    pub fn load_from(env: Environment) -> Result<Self, AmqpError> {
        Config::builder()
            .add_source(env.separator("__").try_parsing(true))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| {
                error!(error = err.to_string(), "invalid configuration");
                AmqpError::InvalidConfigs(err.to_string())
            })
    }
}
