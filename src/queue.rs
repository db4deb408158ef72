// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! A declared queue owns one channel per incarnation, an optional prefetch
//! window, and at most one consumer subscription. The consumer wrapper
//! turns every delivery into a [`Message`], invokes the user callback, and
//! answers requests that carry a `reply_to` address through the default
//! exchange with the original correlation id. Callback failures are logged
//! and leave acknowledgement to the user.

use crate::{
    binding::{Binding, Destination},
    broker::{Arguments, BrokerChannel, ConsumeOptions, Delivery, QueueDeclare},
    connection::ConnectionInner,
    errors::AmqpError,
    message::Message,
    node::{claim_terminal, Node, NodeState},
    readiness::Latch,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, Weak},
};
use tracing::{debug, error};

/// Constant for the argument field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument field used to expire an unused queue
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Constant for the argument field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Configuration for a declared queue.
///
/// Structural options are folded into the broker's `x-*` declaration
/// arguments when the queue is asserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Passively check the queue instead of creating it.
    pub no_create: bool,
    pub prefetch: Option<u16>,
    pub message_ttl: Option<i64>,
    pub expires: Option<i64>,
    pub dead_letter_exchange: Option<String>,
    pub max_length: Option<i64>,
    pub arguments: Arguments,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Switches assertion into a passive existence check.
    pub fn no_create(mut self) -> Self {
        self.no_create = true;
        self
    }

    /// Caps the number of unacknowledged deliveries in flight.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn message_ttl(mut self, ttl: i64) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Expires the queue after the given idle time in milliseconds.
    pub fn expires(mut self, ttl: i64) -> Self {
        self.expires = Some(ttl);
        self
    }

    /// Routes dead-lettered messages to the named exchange.
    pub fn dead_letter_exchange(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(name.into());
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Options for a consumer subscription on a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerOptions {
    /// Auto-acknowledge deliveries; ack/nack on the message become no-ops.
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: Arguments,
}

/// Outcome of a consumer callback. `Some(message)` answers a request that
/// carried a `reply_to` address; `None` sends no response.
pub type ConsumerResult = Result<Option<Message>, AmqpError>;

type BoxedConsumer = Arc<dyn Fn(Message) -> BoxFuture<'static, ConsumerResult> + Send + Sync>;

struct ConsumerState {
    callback: Option<BoxedConsumer>,
    options: ConsumerOptions,
    tag: Option<String>,
    initialized: Option<Latch>,
    stopping: bool,
}

pub(crate) struct QueueInner {
    name: String,
    options: QueueOptions,
    connection: Weak<ConnectionInner>,
    state: Mutex<NodeState>,
    prefetch: Mutex<Option<u16>>,
    consumer: Mutex<ConsumerState>,
}

/// A declared queue. Cheap to clone; all clones refer to the same
/// registered entity.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Queue {}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("name", &self.inner.name).finish()
    }
}

impl Queue {
    pub(crate) fn register(
        connection: &Arc<ConnectionInner>,
        name: impl Into<String>,
        options: QueueOptions,
    ) -> Queue {
        let prefetch = options.prefetch;
        Queue {
            inner: Arc::new(QueueInner {
                name: name.into(),
                options,
                connection: Arc::downgrade(connection),
                state: Mutex::new(NodeState::new()),
                prefetch: Mutex::new(prefetch),
                consumer: Mutex::new(ConsumerState {
                    callback: None,
                    options: ConsumerOptions::default(),
                    tag: None,
                    initialized: None,
                    stopping: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// The tag of the active consumer, if one is subscribed.
    pub fn consumer_tag(&self) -> Option<String> {
        self.inner.consumer.lock().unwrap().tag.clone()
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
                debug!("queue: {} was asserted", self.inner.name);
                latch.resolve();
            }
            Err(InitFailure::Assertion(err)) => {
                error!(
                    error = err.to_string(),
                    name = self.inner.name.as_str(),
                    "error to assert the queue"
                );
                if let Some(conn) = self.connection() {
                    conn.unregister_queue(&self.inner.name);
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

        let result = if self.inner.options.no_create {
            channel.check_queue(&self.inner.name).await
        } else {
            channel
                .assert_queue(&self.inner.name, &declare_record(&self.inner.options))
                .await
        };
        result.map_err(InitFailure::Assertion)?;

        let prefetch = *self.inner.prefetch.lock().unwrap();
        if let Some(count) = prefetch {
            channel.prefetch(count).await.map_err(InitFailure::Setup)?;
        }

        Ok(channel)
    }

    /// Publishes a message to this queue through the default exchange.
    pub async fn send(&self, message: &Message) -> Result<(), AmqpError> {
        message.send_to(&Destination::Queue(self.clone()), "").await
    }

    /// Caps the number of unacknowledged deliveries in flight.
    ///
    /// The stored option is updated as well, so rebuilds reapply the same
    /// window to the fresh channel.
    pub async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.initialized().wait().await?;
        self.channel()?.prefetch(count).await?;
        *self.inner.prefetch.lock().unwrap() = Some(count);
        Ok(())
    }

    /// Asks the broker to requeue unacknowledged deliveries on this
    /// queue's channel.
    pub async fn recover(&self) -> Result<(), AmqpError> {
        self.initialized().wait().await?;
        self.channel()?.recover().await
    }

    /// Subscribes a consumer to this queue.
    ///
    /// At most one consumer is active per queue; repeat calls return the
    /// existing subscription's readiness without replacing the callback.
    /// The callback and options are retained so a rebuild can resubscribe
    /// with a fresh consumer tag.
    pub fn activate_consumer<F, Fut>(&self, on_message: F, options: ConsumerOptions) -> Latch
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConsumerResult> + Send + 'static,
    {
        {
            let mut consumer = self.inner.consumer.lock().unwrap();
            if let Some(latch) = &consumer.initialized {
                return latch.clone();
            }
            consumer.callback = Some(Arc::new(
                move |message| -> BoxFuture<'static, ConsumerResult> {
                    Box::pin(on_message(message))
                },
            ));
            consumer.options = options;
        }
        self.initialize_consumer()
    }

    /// (Re)subscribes the stored consumer, obtaining a fresh tag.
    pub(crate) fn initialize_consumer(&self) -> Latch {
        let (callback, options, latch) = {
            let mut consumer = self.inner.consumer.lock().unwrap();
            let Some(callback) = consumer.callback.clone() else {
                return Latch::failed(AmqpError::ConsumeFailed(self.inner.name.clone()));
            };
            let fresh = Latch::new();
            if let Some(old) = consumer.initialized.replace(fresh.clone()) {
                old.follow(&fresh);
            }
            consumer.stopping = false;
            (callback, consumer.options.clone(), fresh)
        };

        let this = self.clone();
        let consumer_latch = latch.clone();
        tokio::spawn(async move {
            this.run_consume(callback, options, consumer_latch).await;
        });
        latch
    }

    async fn run_consume(&self, callback: BoxedConsumer, options: ConsumerOptions, latch: Latch) {
        if let Err(err) = self.initialized().wait().await {
            latch.reject(err);
            return;
        }
        let channel = match self.channel() {
            Ok(channel) => channel,
            Err(err) => {
                latch.reject(err);
                return;
            }
        };

        let consume_options = ConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            arguments: options.arguments.clone(),
        };
        let (tag, mut stream) = match channel.consume(&self.inner.name, &consume_options).await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.inner.name.as_str(),
                    "error to create the consumer"
                );
                latch.reject(err);
                return;
            }
        };

        debug!("consumer on queue: {} started with tag: {}", self.inner.name, tag);
        self.inner.consumer.lock().unwrap().tag = Some(tag);
        latch.resolve();

        while let Some(delivery) = stream.next().await {
            self.handle_delivery(&channel, &callback, options.no_ack, delivery).await;
        }
    }

    /// Wraps one delivery: builds the message, runs the user callback, and
    /// answers the reply-to address when the delivery is a request.
    async fn handle_delivery(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        callback: &BoxedConsumer,
        no_ack: bool,
        delivery: Delivery,
    ) {
        let reply_to = delivery.properties.reply_to.clone();
        let correlation_id = delivery.properties.correlation_id.clone();
        let ack_channel = if no_ack { None } else { Some(channel.clone()) };
        let message = Message::received(delivery, ack_channel);

        match callback(message).await {
            Err(err) => {
                // The delivery stays with the user to ack or nack.
                error!(
                    error = err.to_string(),
                    queue = self.inner.name.as_str(),
                    "consumer callback failed"
                );
            }
            Ok(response) => {
                let (Some(reply_to), Some(mut response)) = (reply_to, response) else {
                    return;
                };
                response.properties_mut().correlation_id = correlation_id;
                if let Err(err) = channel
                    .publish("", &reply_to, response.content(), response.properties())
                    .await
                {
                    error!(error = err.to_string(), "error to publish the rpc response");
                }
            }
        }
    }

    /// Cancels the active consumer and clears its state. No-op when no
    /// consumer is active or a stop is already underway.
    pub async fn stop_consumer(&self) -> Result<(), AmqpError> {
        let latch = {
            let mut consumer = self.inner.consumer.lock().unwrap();
            let Some(latch) = consumer.initialized.clone() else {
                return Ok(());
            };
            if consumer.stopping {
                return Ok(());
            }
            consumer.stopping = true;
            latch
        };

        latch.wait().await?;
        let tag = self.inner.consumer.lock().unwrap().tag.take();
        if let Some(tag) = tag {
            self.channel()?.cancel(&tag).await?;
        }

        let mut consumer = self.inner.consumer.lock().unwrap();
        consumer.callback = None;
        consumer.options = ConsumerOptions::default();
        consumer.initialized = None;
        consumer.stopping = false;
        Ok(())
    }

    pub(crate) fn has_consumer(&self) -> bool {
        let consumer = self.inner.consumer.lock().unwrap();
        consumer.callback.is_some() && !consumer.stopping
    }

    pub(crate) fn consumer_latch(&self) -> Option<Latch> {
        self.inner.consumer.lock().unwrap().initialized.clone()
    }

    /// Binds this queue to messages routed by `source`.
    pub fn bind(
        &self,
        source: &crate::exchange::Exchange,
        pattern: &str,
        args: Arguments,
    ) -> Result<Binding, AmqpError> {
        Binding::declare(
            Destination::Queue(self.clone()),
            Destination::Exchange(source.clone()),
            pattern,
            args,
        )
    }

    /// Removes the binding from `source` with the given pattern.
    pub async fn unbind(
        &self,
        source: &crate::exchange::Exchange,
        pattern: &str,
    ) -> Result<(), AmqpError> {
        let conn = self.connection().ok_or(AmqpError::ConnectionClosing)?;
        let id = Binding::derive_id(&Destination::Queue(self.clone()), source.name(), pattern);
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
            Binding::remove_bindings_containing(&conn, &Destination::Queue(self.clone())).await?;
        }

        self.stop_consumer().await?;

        let channel = self.channel()?;
        if delete_from_broker {
            channel.delete_queue(&self.inner.name).await?;
        }
        channel.close().await?;

        if let Some(conn) = self.connection() {
            conn.unregister_queue(&self.inner.name);
        }

        let mut state = self.inner.state.lock().unwrap();
        state.channel = None;
        state.initialized =
            Latch::failed(AmqpError::Invalidated(format!("queue `{}`", self.inner.name)));
        Ok(())
    }
}

#[async_trait]
impl Node for Queue {
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

/// Folds the structural options into the broker's declaration arguments.
fn declare_record(options: &QueueOptions) -> QueueDeclare {
    let mut arguments = options.arguments.clone();
    if let Some(ttl) = options.message_ttl {
        arguments.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), Value::from(ttl));
    }
    if let Some(expires) = options.expires {
        arguments.insert(AMQP_HEADERS_EXPIRES.to_owned(), Value::from(expires));
    }
    if let Some(dlx) = &options.dead_letter_exchange {
        arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            Value::String(dlx.clone()),
        );
    }
    if let Some(max) = options.max_length {
        arguments.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), Value::from(max));
    }
    QueueDeclare {
        durable: options.durable,
        auto_delete: options.auto_delete,
        exclusive: options.exclusive,
        arguments,
    }
}
