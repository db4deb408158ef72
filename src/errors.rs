// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topology Manager
//!
//! This module provides the error taxonomy for every operation the topology
//! manager performs: connecting and reconnecting, declaring exchanges, queues
//! and bindings, publishing, and consuming. Entity-level failures stay scoped
//! to that entity's readiness; connection-level failures escalate to the
//! supervisor and drive a rebuild.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants are `Clone` so a rejected readiness latch can fan the failure out
/// to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A single connect attempt against the broker failed
    #[error("failure to connect: `{0}`")]
    ConnectionFailed(String),

    /// The reconnect retry budget was consumed without a successful connect
    #[error("connection retries exhausted after `{0}` attempts")]
    ConnectionExhausted(u32),

    /// The connection was explicitly closed; no further work is accepted
    #[error("connection is closing")]
    ConnectionClosing,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: `{0}`")]
    ChannelFailed(String),

    /// The broker rejected an exchange, queue, or binding declaration
    #[error("failure to assert `{0}`")]
    AssertionFailed(String),

    /// Error publishing a message
    #[error("failure to publish: `{0}`")]
    PublishFailed(String),

    /// Error subscribing a consumer to a queue
    #[error("failure to start consumer on `{0}`")]
    ConsumeFailed(String),

    /// A user consumer callback failed while handling a delivery
    #[error("failure to consume message: `{0}`")]
    ConsumerError(String),

    /// A declared binding names neither a queue nor an exchange destination
    #[error("binding declares neither a queue nor an exchange destination")]
    InvalidBinding,

    /// A binding was constructed with a source that is not an exchange
    #[error("binding source `{0}` is not an exchange")]
    InvalidBindingSource(String),

    /// An unbind was requested for a binding that is not registered
    #[error("no binding `{0}` is registered")]
    BindingNotFound(String),

    /// The entity was deleted or closed and no longer accepts operations
    #[error("`{0}` was deleted or closed")]
    Invalidated(String),

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload: `{0}`")]
    ParsePayloadError(String),
}
