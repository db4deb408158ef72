// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! A declared exchange owns one channel per incarnation. Initialization
//! waits for the connection, creates the channel, installs the
//! direct-reply-to consumer used for RPC correlation, and asserts the
//! exchange (or passively checks it when `no_create` is set). Publishing
//! and RPC entry points live here; request/response pairs are matched
//! through a correlation map of one-shot senders rather than an event bus.

use crate::{
    binding::{Binding, Destination},
    broker::{Arguments, BrokerChannel, ConsumeOptions, Delivery, ExchangeDeclare},
    connection::ConnectionInner,
    errors::AmqpError,
    message::Message,
    node::{claim_terminal, Node, NodeState},
    readiness::Latch,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// The broker's direct-reply-to pseudo queue used for RPC responses.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Argument key used to configure an alternate exchange
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available in RabbitMQ.
///
/// The `Custom` variant passes any other kind name through to the broker
/// opaquely, e.g. for plugin-provided exchange types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Headers => f.write_str("headers"),
            ExchangeKind::Custom(kind) => f.write_str(kind),
        }
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl Serialize for ExchangeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExchangeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(ExchangeKind::from(kind.as_str()))
    }
}

/// Configuration for a declared exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Passively check the exchange instead of creating it.
    pub no_create: bool,
    pub alternate_exchange: Option<String>,
    pub arguments: Arguments,
}

impl ExchangeOptions {
    pub fn new() -> ExchangeOptions {
        ExchangeOptions::default()
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Switches assertion into a passive existence check.
    pub fn no_create(mut self) -> Self {
        self.no_create = true;
        self
    }

    /// Routes unroutable messages to the named alternate exchange.
    pub fn alternate_exchange(mut self, name: impl Into<String>) -> Self {
        self.alternate_exchange = Some(name.into());
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

type ReplyMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

pub(crate) struct ExchangeInner {
    name: String,
    kind: ExchangeKind,
    options: ExchangeOptions,
    connection: Weak<ConnectionInner>,
    state: Mutex<NodeState>,
    replies: ReplyMap,
}

/// A declared exchange. Cheap to clone; all clones refer to the same
/// registered entity.
#[derive(Clone)]
pub struct Exchange {
    pub(crate) inner: Arc<ExchangeInner>,
}

impl PartialEq for Exchange {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Exchange {}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl Exchange {
    pub(crate) fn register(
        connection: &Arc<ConnectionInner>,
        name: impl Into<String>,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Exchange {
        Exchange {
            inner: Arc::new(ExchangeInner {
                name: name.into(),
                kind,
                options,
                connection: Arc::downgrade(connection),
                state: Mutex::new(NodeState::new()),
                replies: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.inner.kind
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.inner.options
    }

    pub(crate) fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.inner.state.lock().unwrap().channel()
    }

    pub(crate) fn connection(&self) -> Option<Arc<ConnectionInner>> {
        self.inner.connection.upgrade()
    }

    /// Starts the first initialization using the latch created at
    /// registration, so no caller can observe a replaced pending latch.
    pub(crate) fn kickoff(&self) {
        let latch = self.initialized();
        let this = self.clone();
        tokio::spawn(async move { this.run_initialize(latch).await });
    }

    /// Starts a fresh incarnation during a rebuild. Waiters on the old
    /// latch follow the fresh one.
    pub(crate) fn reinitialize(&self) -> Latch {
        let fresh = Latch::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.channel = None;
            let old = std::mem::replace(&mut state.initialized, fresh.clone());
            old.follow(&fresh);
        }
        let this = self.clone();
        let latch = fresh.clone();
        tokio::spawn(async move { this.run_initialize(latch).await });
        fresh
    }

    async fn run_initialize(&self, latch: Latch) {
        match self.assert().await {
            Ok(channel) => {
                self.inner.state.lock().unwrap().channel = Some(channel);
                debug!("exchange: {} was asserted", self.inner.name);
                latch.resolve();
            }
            Err(InitFailure::Assertion(err)) => {
                error!(
                    error = err.to_string(),
                    name = self.inner.name.as_str(),
                    "error to assert the exchange"
                );
                if let Some(conn) = self.connection() {
                    conn.unregister_exchange(&self.inner.name);
                }
                latch.reject(err);
            }
            Err(InitFailure::Setup(err)) => latch.reject(err),
        }
    }

    async fn assert(&self) -> Result<Arc<dyn BrokerChannel>, InitFailure> {
        let conn = self
            .connection()
            .ok_or(InitFailure::Setup(AmqpError::ConnectionClosing))?;
        conn.initialized().wait().await.map_err(InitFailure::Setup)?;

        let handle = conn.handle().map_err(InitFailure::Setup)?;
        let channel = handle.create_channel().await.map_err(InitFailure::Setup)?;

        self.start_reply_consumer(&channel)
            .await
            .map_err(InitFailure::Setup)?;

        let result = if self.inner.options.no_create {
            channel.check_exchange(&self.inner.name).await
        } else {
            channel
                .assert_exchange(&self.inner.name, &self.declare_record())
                .await
        };
        result.map_err(InitFailure::Assertion)?;

        Ok(channel)
    }

    fn declare_record(&self) -> ExchangeDeclare {
        let options = &self.inner.options;
        let mut arguments = options.arguments.clone();
        if let Some(alternate) = &options.alternate_exchange {
            arguments.insert(
                AMQP_HEADERS_ALTERNATE_EXCHANGE.to_owned(),
                Value::String(alternate.clone()),
            );
        }
        ExchangeDeclare {
            kind: self.inner.kind.to_string(),
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            arguments,
        }
    }

    /// Consumes the direct-reply-to pseudo queue on this exchange's channel
    /// and dispatches arriving responses by correlation id.
    async fn start_reply_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
    ) -> Result<(), AmqpError> {
        let (_tag, mut stream) = channel
            .consume(
                DIRECT_REPLY_TO,
                &ConsumeOptions {
                    no_ack: true,
                    ..ConsumeOptions::default()
                },
            )
            .await?;

        let replies = self.inner.replies.clone();
        tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                dispatch_reply(&replies, delivery);
            }
        });
        Ok(())
    }

    /// Publishes a message to this exchange.
    pub async fn send(&self, message: &Message, routing_key: &str) -> Result<(), AmqpError> {
        message
            .send_to(&Destination::Exchange(self.clone()), routing_key)
            .await
    }

    /// Publishes a request and resolves with the correlated response.
    ///
    /// A fresh v4 UUID disambiguates concurrent calls: each registers its
    /// own one-shot sender under its correlation id, so responses resolve
    /// to their requests regardless of arrival order.
    pub async fn rpc(&self, request: &Message, routing_key: &str) -> Result<Message, AmqpError> {
        self.initialized().wait().await?;
        let channel = self.channel()?;

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .replies
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), tx);

        let mut properties = request.properties().clone();
        properties.correlation_id = Some(correlation_id.clone());
        properties.reply_to = Some(DIRECT_REPLY_TO.to_owned());

        if let Err(err) = channel
            .publish(&self.inner.name, routing_key, request.content(), &properties)
            .await
        {
            self.inner.replies.lock().unwrap().remove(&correlation_id);
            return Err(err);
        }

        rx.await.map_err(|_| AmqpError::InternalError)
    }

    /// Binds this exchange to messages routed by `source`.
    pub fn bind(
        &self,
        source: &Exchange,
        pattern: &str,
        args: Arguments,
    ) -> Result<Binding, AmqpError> {
        Binding::declare(
            Destination::Exchange(self.clone()),
            Destination::Exchange(source.clone()),
            pattern,
            args,
        )
    }

    /// Removes the binding from `source` with the given pattern.
    pub async fn unbind(&self, source: &Exchange, pattern: &str) -> Result<(), AmqpError> {
        let conn = self.connection().ok_or(AmqpError::ConnectionClosing)?;
        let id = Binding::derive_id(&Destination::Exchange(self.clone()), source.name(), pattern);
        match conn.binding(&id) {
            Some(binding) => binding.delete().await,
            None => Err(AmqpError::BindingNotFound(id)),
        }
    }

    async fn shutdown(&self, delete_from_broker: bool) -> Result<(), AmqpError> {
        let (latch, first) = {
            let mut state = self.inner.state.lock().unwrap();
            let slot = if delete_from_broker {
                &mut state.deleting
            } else {
                &mut state.closing
            };
            claim_terminal(slot)
        };
        if !first {
            return latch.wait().await;
        }

        let result = self.teardown(delete_from_broker).await;
        latch.settle(result.clone());
        result
    }

    async fn teardown(&self, delete_from_broker: bool) -> Result<(), AmqpError> {
        self.initialized().wait().await?;

        if let Some(conn) = self.connection() {
            Binding::remove_bindings_containing(&conn, &Destination::Exchange(self.clone()))
                .await?;
        }

        let channel = self.channel()?;
        if delete_from_broker {
            channel.delete_exchange(&self.inner.name).await?;
        }
        channel.close().await?;

        if let Some(conn) = self.connection() {
            conn.unregister_exchange(&self.inner.name);
        }

        let mut state = self.inner.state.lock().unwrap();
        state.channel = None;
        state.initialized =
            Latch::failed(AmqpError::Invalidated(format!("exchange `{}`", self.inner.name)));
        Ok(())
    }
}

#[async_trait]
impl Node for Exchange {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn initialized(&self) -> Latch {
        self.inner.state.lock().unwrap().initialized.clone()
    }

    async fn delete(&self) -> Result<(), AmqpError> {
        self.shutdown(true).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown(false).await
    }
}

enum InitFailure {
    /// Failure before the assert itself; the entity stays registered so a
    /// later rebuild can still bring it up.
    Setup(AmqpError),
    /// The broker rejected the declaration; the entity is unregistered.
    Assertion(AmqpError),
}

fn dispatch_reply(replies: &ReplyMap, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
        return;
    };
    let sender = replies.lock().unwrap().remove(&correlation_id);
    if let Some(tx) = sender {
        let _ = tx.send(Message::received(delivery, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_renders_and_parses_its_wire_name() {
        assert_eq!(ExchangeKind::Topic.to_string(), "topic");
        assert_eq!(ExchangeKind::from("headers"), ExchangeKind::Headers);
        assert_eq!(
            ExchangeKind::from("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert_eq!(
            ExchangeKind::Custom("x-delayed-message".to_owned()).to_string(),
            "x-delayed-message"
        );
    }

    #[test]
    fn kind_round_trips_through_serde() {
        let kind: ExchangeKind = serde_json::from_value(json!("fanout")).unwrap();
        assert_eq!(kind, ExchangeKind::Fanout);
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("fanout"));
    }

    #[test]
    fn options_builder_sets_the_declare_flags() {
        let options = ExchangeOptions::new()
            .durable()
            .internal()
            .alternate_exchange("fallback")
            .argument("x-sample", json!(1));

        assert!(options.durable);
        assert!(options.internal);
        assert!(!options.auto_delete);
        assert_eq!(options.alternate_exchange.as_deref(), Some("fallback"));
        assert_eq!(options.arguments.get("x-sample"), Some(&json!(1)));
    }

    #[test]
    fn options_deserialize_from_camel_case() {
        let options: ExchangeOptions =
            serde_json::from_value(json!({"durable": true, "noCreate": true})).unwrap();
        assert!(options.durable);
        assert!(options.no_create);
        assert!(!options.internal);
    }
}
