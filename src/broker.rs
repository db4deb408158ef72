// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Seam
//!
//! The wire-level AMQP 0-9-1 client is an external collaborator. This module
//! defines the capability it must provide as a trio of object-safe async
//! traits: [`Broker`] opens connections, [`BrokerConnection`] creates
//! channels, and [`BrokerChannel`] carries every per-channel operation the
//! topology manager issues. The `amqp` module implements them over lapin;
//! tests implement them over an in-memory broker.
//!
//! Free-form argument maps cross this boundary as JSON maps and are
//! converted to the client's native table type inside the implementation.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::Stream;
use std::{pin::Pin, sync::Arc};
use tokio::sync::mpsc;

/// Free-form string-keyed argument map used for declaration arguments,
/// binding arguments, message headers, and socket options.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// A stream of deliveries produced by an active consumer. The stream ends
/// when the consumer is cancelled or its channel dies.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Receiver half for connection-level events.
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Connection-level events surfaced by the broker client.
///
/// These replace the `error`/`close` listener pair of callback-style
/// clients: the supervisor drains the receiver on a background task and
/// decides whether an event warrants a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The underlying connection failed.
    Error(String),
    /// The underlying connection closed.
    Closed,
}

/// The property set carried by a published or delivered message.
///
/// A deliberately narrow record: the fields the topology manager itself
/// reads or writes are typed, everything else travels in `headers`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub expiration: Option<String>,
    pub persistent: bool,
    pub headers: Arguments,
}

/// A single message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Declaration parameters for an exchange, with the kind already rendered
/// to its wire name so custom kinds pass through opaquely.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclare {
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: Arguments,
}

/// Declaration parameters for a queue. Structural options such as message
/// TTL arrive already folded into `arguments` as their `x-*` keys.
#[derive(Debug, Clone, Default)]
pub struct QueueDeclare {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: Arguments,
}

/// Options for starting a consumer subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: Arguments,
}

/// Entry point of the broker client: opens logical connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Attempts a single connect against `url`.
    ///
    /// On success returns the connection handle together with the receiver
    /// for its connection-level events. One receiver per connection; it is
    /// dropped with the incarnation it belongs to.
    async fn connect(
        &self,
        url: &str,
        socket_options: &Arguments,
    ) -> Result<(Arc<dyn BrokerConnection>, EventReceiver), AmqpError>;
}

/// An established connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel on an established connection. Each node of the topology owns
/// exactly one channel for the lifetime of a single incarnation.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(&self, name: &str, declare: &ExchangeDeclare) -> Result<(), AmqpError>;

    /// Passively checks that the exchange exists without creating it.
    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn assert_queue(&self, name: &str, declare: &QueueDeclare) -> Result<(), AmqpError>;

    /// Passively checks that the queue exists without creating it.
    async fn check_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError>;

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer and returns its server-assigned tag together with
    /// the stream of deliveries.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<(String, DeliveryStream), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Asks the broker to requeue unacknowledged deliveries on this channel.
    async fn recover(&self) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
