// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error types shared by every broker backend and by the
//! messaging patterns built on top of them. The `AmqpError` enum covers connection,
//! topology, publishing and consuming failures; RPC specific failures live in
//! [`crate::rpc::RpcError`].

use thiserror::Error;

/// Represents errors that can occur while talking to a broker.
///
/// The same variants are produced by the in-memory broker and by the RabbitMQ
/// backend, so callers can handle both uniformly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Configuration could not be loaded or deserialized
    #[error("invalid configuration `{0}`")]
    InvalidConfigs(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The session was closed (or the broker restarted) before the operation
    #[error("session closed")]
    SessionClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A subscription was requested without any binding key
    #[error("at least one binding key is required for exchange `{0}`")]
    MissingBindingKeys(String),

    /// The exchange does not exist
    #[error("exchange not found `{0}`")]
    ExchangeNotFound(String),

    /// The queue does not exist
    #[error("queue not found `{0}`")]
    QueueNotFound(String),

    /// The queue is exclusive to another session
    #[error("queue `{0}` is locked by another connection")]
    ExclusiveQueueLocked(String),

    /// Redeclaration with incompatible arguments
    #[error("precondition failed `{0}`")]
    PreconditionFailed(String),

    /// Error publishing a message
    #[error("failure to publish message")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The delivery tag is not outstanding on this session
    #[error("unknown delivery tag `{0}`")]
    UnknownDeliveryTag(u64),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Failures of the broker link rather than of the message itself. A delivery
    /// whose handling failed this way is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::PublishingError
                | AmqpError::SessionClosed
                | AmqpError::ConnectionError
                | AmqpError::ChannelError
        )
    }
}
