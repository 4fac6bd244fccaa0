// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection and channel supervision, topology
//! declaration, consumption, and confirmed publishing. Supervisors absorb the
//! failures they can retry; the variants here are the ones that reach callers
//! through an operation they directly requested.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Recoverable failures (an unreachable broker, a dropped channel) are retried
/// internally by the owning supervisor and surface only as lifecycle events
/// and log lines. The variants below are returned from the operation futures
/// that requested the failing action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// A connector was constructed with no broker URIs
    #[error("at least one broker uri is required")]
    UriListEmpty,

    /// An operation required a live connection but the connection is closed
    #[error("connection already closed")]
    ConnectionClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A listener was stopped before its first full consumer startup completed
    #[error("listener stopped during startup")]
    InterruptedStartup,

    /// A tiered listener was constructed with no tiers
    #[error("at least one tier is required")]
    TierListEmpty,

    /// An outgoing message had no routing key
    #[error("outgoing message requires a routing key")]
    MissingRoutingKey,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged a published message
    #[error("broker nacked the publish")]
    PublishNacked,

    /// A publish stream already failed and accepts no further writes
    #[error("publish stream is failed")]
    StreamFailed,
}
