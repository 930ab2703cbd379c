// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pulse Client
//!
//! This module provides a comprehensive set of error types for Pulse operations.
//! The `PulseError` enum represents all possible error scenarios that can occur during
//! credential resolution, connection lifecycle, queue declaration, and message handling.

use thiserror::Error;

/// Represents errors that can occur while talking to a Pulse broker.
///
/// This enum covers all error scenarios for Pulse interactions, including connection
/// issues, channel creation, queue declaration and binding, consumer registration,
/// and message acknowledgement. Configuration mistakes are reported synchronously
/// at construction time through the same type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PulseError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the Pulse broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The supplied AMQP connection string could not be parsed or is incomplete
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Error obtaining credentials from a credential provider
    #[error("failure to obtain credentials: {0}")]
    CredentialsError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a channel
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error parsing a message payload as UTF-8 JSON
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A routing key did not line up with its reference
    #[error("routing key `{0}` does not match its reference")]
    RoutingKeyMismatch(String),

    /// A routing-key reference declared more than one multi-word part
    #[error("a routing-key reference allows at most one multi-word part")]
    AmbiguousRoutingKeyReference,

    /// A required configuration option was not supplied
    #[error("`{0}` is required")]
    MissingOption(String),

    /// Mutually exclusive configuration options were supplied together
    #[error("conflicting options: {0}")]
    ConflictingOptions(String),

    /// An operation needed a running manager but the manager was stopped
    #[error("the manager is stopped")]
    ManagerStopped,

    /// An exclusive queue vanished because its connection retired
    #[error("exclusive queue lost its connection")]
    ExclusiveQueueDisconnected,
}
