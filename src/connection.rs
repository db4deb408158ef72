// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! The [`Connection`] maintains a single logical connection to the broker
//! and the registry of every declared exchange, queue, and binding. A
//! bounded or unbounded retry loop drives connect attempts; on a
//! connection-level error the supervisor replaces every readiness latch,
//! reconnects, and re-asserts the whole registered topology in dependency
//! order: exchanges, queues, consumers, bindings.

use crate::{
    amqp::AmqpBroker,
    binding::{Binding, Destination},
    broker::{Arguments, Broker, BrokerConnection, ConnectionEvent, EventReceiver},
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    node::Node,
    queue::{Queue, QueueOptions},
    readiness::Latch,
    topology::TopologyDefinition,
};
use futures_util::future::join_all;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Default broker url used by [`Connection::open`] callers that pass one in
/// from configuration.
pub const DEFAULT_URL: &str = "amqp://localhost:5672";

/// Retry policy for the connect loop.
///
/// `retries = 0` retries indefinitely; `retries = N` allows the initial
/// attempt plus `N` retries, spaced by `interval`, before the connection's
/// readiness rejects with `ConnectionExhausted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectStrategy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        ReconnectStrategy {
            retries: 0,
            interval: Duration::from_millis(1500),
        }
    }
}

struct SupervisorState {
    handle: Option<Arc<dyn BrokerConnection>>,
    initialized: Latch,
    /// Readiness of the in-flight rebuild, resolved when the whole
    /// topology has re-asserted.
    rebuild_ready: Latch,
    rebuilding: bool,
    is_closing: bool,
    /// Incremented per incarnation so stale event listeners and connect
    /// loops can recognize they were superseded.
    epoch: u64,
}

struct Registry {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    bindings: HashMap<String, Binding>,
}

pub(crate) struct ConnectionInner {
    url: String,
    socket_options: Arguments,
    reconnect: ReconnectStrategy,
    broker: Arc<dyn Broker>,
    state: Mutex<SupervisorState>,
    registry: Mutex<Registry>,
}

struct RebuildTicket {
    conn_latch: Latch,
    overall: Latch,
    epoch: u64,
}

impl ConnectionInner {
    pub(crate) fn initialized(&self) -> Latch {
        self.state.lock().unwrap().initialized.clone()
    }

    pub(crate) fn handle(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.state
            .lock()
            .unwrap()
            .handle
            .clone()
            .ok_or_else(|| AmqpError::ConnectionFailed("no active connection".to_owned()))
    }

    fn is_closing(&self) -> bool {
        self.state.lock().unwrap().is_closing
    }

    /// Atomically claims the right to rebuild. Returns `None` when a
    /// rebuild is already in flight, collapsing concurrent triggers.
    fn claim_rebuild(&self) -> Option<RebuildTicket> {
        let mut state = self.state.lock().unwrap();
        if state.rebuilding {
            return None;
        }
        state.rebuilding = true;
        state.epoch += 1;
        state.handle = None;

        let conn_latch = Latch::new();
        let old = std::mem::replace(&mut state.initialized, conn_latch.clone());
        old.follow(&conn_latch);

        let overall = Latch::new();
        let old = std::mem::replace(&mut state.rebuild_ready, overall.clone());
        old.follow(&overall);

        Some(RebuildTicket {
            conn_latch,
            overall,
            epoch: state.epoch,
        })
    }

    /// Spawns the connect loop and the task that settles the rebuild's
    /// overall readiness once the topology has re-asserted.
    fn launch_connect(self: &Arc<Self>, ticket: RebuildTicket) -> (Latch, Latch) {
        let RebuildTicket {
            conn_latch,
            overall,
            epoch,
        } = ticket;

        let this = self.clone();
        let latch = conn_latch.clone();
        tokio::spawn(async move { this.try_to_connect(epoch, latch).await });

        let this = self.clone();
        let conn_ready = conn_latch.clone();
        let done = overall.clone();
        tokio::spawn(async move {
            let result = match conn_ready.wait().await {
                Ok(()) => this.complete_configuration().await,
                Err(err) => Err(err),
            };
            done.settle(result);
        });

        (conn_latch, overall)
    }

    /// Starts reconnecting unless a rebuild is already in flight, in which
    /// case the in-flight readiness is returned instead of racing a second
    /// attempt.
    pub(crate) fn rebuild_connection(self: &Arc<Self>) -> Latch {
        match self.claim_rebuild() {
            Some(ticket) => self.launch_connect(ticket).0,
            None => self.initialized(),
        }
    }

    /// Reconnects and re-asserts every registered entity and consumer.
    ///
    /// Entity latches are replaced synchronously before the connect loop
    /// starts, so publishes issued from now on queue behind the fresh
    /// readiness and replay against the new channels. The returned latch
    /// settles when the whole topology has re-asserted.
    pub(crate) fn rebuild_all(self: &Arc<Self>, err: AmqpError) -> Latch {
        let Some(ticket) = self.claim_rebuild() else {
            return self.state.lock().unwrap().rebuild_ready.clone();
        };

        error!(
            error = err.to_string(),
            "connection failure, rebuilding connection and topology"
        );

        let (exchanges, queues, bindings) = {
            let registry = self.registry.lock().unwrap();
            (
                registry.exchanges.values().cloned().collect::<Vec<_>>(),
                registry.queues.values().cloned().collect::<Vec<_>>(),
                registry.bindings.values().cloned().collect::<Vec<_>>(),
            )
        };

        for exchange in &exchanges {
            exchange.reinitialize();
        }
        for queue in &queues {
            let had_consumer = queue.has_consumer();
            queue.reinitialize();
            if had_consumer {
                queue.initialize_consumer();
            }
        }
        for binding in &bindings {
            binding.reinitialize();
        }

        self.launch_connect(ticket).1
    }

    async fn try_to_connect(self: Arc<Self>, epoch: u64, latch: Latch) {
        let mut attempt: u32 = 0;
        loop {
            if self.is_closing() {
                self.state.lock().unwrap().rebuilding = false;
                latch.reject(AmqpError::ConnectionClosing);
                return;
            }

            match self.broker.connect(&self.url, &self.socket_options).await {
                Ok((handle, events)) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        if state.epoch != epoch {
                            return;
                        }
                        state.handle = Some(handle);
                        state.rebuilding = false;
                    }
                    info!("connection established to {}", self.url);

                    let this = self.clone();
                    tokio::spawn(async move { this.listen_events(epoch, events).await });
                    latch.resolve();
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    let retries = self.reconnect.retries;
                    if retries != 0 && attempt > retries {
                        error!(
                            error = err.to_string(),
                            attempts = attempt,
                            "connection retries exhausted"
                        );
                        self.state.lock().unwrap().rebuilding = false;
                        latch.reject(AmqpError::ConnectionExhausted(attempt));
                        return;
                    }
                    warn!(error = err.to_string(), attempt, "failure to connect, retrying");
                    sleep(self.reconnect.interval).await;
                }
            }
        }
    }

    /// Reacts to connection-level events for one incarnation. The listener
    /// detaches itself after the first event it acts on; events from
    /// superseded incarnations are ignored.
    async fn listen_events(self: Arc<Self>, epoch: u64, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            if self.state.lock().unwrap().epoch != epoch {
                return;
            }
            match event {
                ConnectionEvent::Error(err) => {
                    self.rebuild_all(AmqpError::ConnectionFailed(err));
                    return;
                }
                ConnectionEvent::Closed => {
                    if self.is_closing() {
                        debug!("connection closed");
                        return;
                    }
                    self.rebuild_all(AmqpError::ConnectionFailed(
                        "connection closed by remote host".to_owned(),
                    ));
                    return;
                }
            }
        }
    }

    /// Settles when every currently-registered entity and every active
    /// consumer has asserted against the broker.
    pub(crate) async fn complete_configuration(&self) -> Result<(), AmqpError> {
        let latches = {
            let registry = self.registry.lock().unwrap();
            let mut latches: Vec<Latch> =
                registry.exchanges.values().map(|e| e.initialized()).collect();
            for queue in registry.queues.values() {
                latches.push(queue.initialized());
                if let Some(latch) = queue.consumer_latch() {
                    latches.push(latch);
                }
            }
            latches.extend(registry.bindings.values().map(|b| b.initialized()));
            latches
        };

        let results = join_all(latches.iter().map(|latch| latch.wait())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    pub(crate) fn register_binding(&self, binding: Binding) {
        self.registry
            .lock()
            .unwrap()
            .bindings
            .insert(binding.id(), binding);
    }

    pub(crate) fn unregister_exchange(&self, name: &str) {
        self.registry.lock().unwrap().exchanges.remove(name);
    }

    pub(crate) fn unregister_queue(&self, name: &str) {
        self.registry.lock().unwrap().queues.remove(name);
    }

    pub(crate) fn unregister_binding(&self, id: &str) {
        self.registry.lock().unwrap().bindings.remove(id);
    }

    pub(crate) fn binding(&self, id: &str) -> Option<Binding> {
        self.registry.lock().unwrap().bindings.get(id).cloned()
    }

    pub(crate) fn bindings_containing(&self, node: &Destination) -> Vec<Binding> {
        self.registry
            .lock()
            .unwrap()
            .bindings
            .values()
            .filter(|binding| binding.touches(node))
            .cloned()
            .collect()
    }
}

/// Handle onto one logical broker connection and its declared topology.
/// Cheap to clone; all clones supervise the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Opens a connection to `url` with default socket options and an
    /// unbounded reconnect policy, and starts connecting immediately.
    pub fn open(url: impl Into<String>) -> Connection {
        Connection::open_with(url, Arguments::new(), ReconnectStrategy::default())
    }

    /// Opens a connection with explicit socket options and retry policy.
    pub fn open_with(
        url: impl Into<String>,
        socket_options: Arguments,
        reconnect: ReconnectStrategy,
    ) -> Connection {
        Connection::with_broker(AmqpBroker::new(), url, socket_options, reconnect)
    }

    /// Opens a connection through an explicit broker backend.
    pub fn with_broker(
        broker: Arc<dyn Broker>,
        url: impl Into<String>,
        socket_options: Arguments,
        reconnect: ReconnectStrategy,
    ) -> Connection {
        let inner = Arc::new(ConnectionInner {
            url: url.into(),
            socket_options,
            reconnect,
            broker,
            state: Mutex::new(SupervisorState {
                handle: None,
                initialized: Latch::new(),
                rebuild_ready: Latch::new(),
                rebuilding: false,
                is_closing: false,
                epoch: 0,
            }),
            registry: Mutex::new(Registry {
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: HashMap::new(),
            }),
        });
        inner.rebuild_connection();
        Connection { inner }
    }

    /// Readiness of the current connection incarnation.
    pub fn initialized(&self) -> Latch {
        self.inner.initialized()
    }

    /// Declares an exchange and starts asserting it against the broker.
    ///
    /// Returns the already-registered exchange if one with this name
    /// exists; the first declaration's kind and options win. The default
    /// exchange cannot be declared.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<Exchange, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::AssertionFailed(
                "the default exchange cannot be declared".to_owned(),
            ));
        }
        let exchange = {
            let mut registry = self.inner.registry.lock().unwrap();
            if let Some(existing) = registry.exchanges.get(name) {
                return Ok(existing.clone());
            }
            let exchange = Exchange::register(&self.inner, name, kind, options);
            registry.exchanges.insert(name.to_owned(), exchange.clone());
            exchange
        };
        exchange.kickoff();
        Ok(exchange)
    }

    /// Declares a queue and starts asserting it against the broker.
    ///
    /// Returns the already-registered queue if one with this name exists;
    /// the first declaration's options win.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> Queue {
        let queue = {
            let mut registry = self.inner.registry.lock().unwrap();
            if let Some(existing) = registry.queues.get(name) {
                return existing.clone();
            }
            let queue = Queue::register(&self.inner, name, options);
            registry.queues.insert(name.to_owned(), queue.clone());
            queue
        };
        queue.kickoff();
        queue
    }

    /// Declares a whole topology: all exchanges and queues, then every
    /// binding, declaring binding endpoints on the fly. Resolves when every
    /// produced readiness has resolved.
    pub async fn declare_topology(&self, topology: &TopologyDefinition) -> Result<(), AmqpError> {
        for exchange in &topology.exchanges {
            self.declare_exchange(&exchange.name, exchange.kind.clone(), exchange.options.clone())?;
        }
        for queue in &topology.queues {
            self.declare_queue(&queue.name, queue.options.clone());
        }
        for binding in &topology.bindings {
            let source = self.declare_exchange(
                &binding.source,
                ExchangeKind::default(),
                ExchangeOptions::default(),
            )?;
            if let Some(exchange_name) = &binding.exchange {
                let destination = self.declare_exchange(
                    exchange_name,
                    ExchangeKind::default(),
                    ExchangeOptions::default(),
                )?;
                destination.bind(&source, &binding.pattern, binding.args.clone())?;
            } else if let Some(queue_name) = &binding.queue {
                let destination = self.declare_queue(queue_name, QueueOptions::default());
                destination.bind(&source, &binding.pattern, binding.args.clone())?;
            } else {
                return Err(AmqpError::InvalidBinding);
            }
        }
        self.complete_configuration().await
    }

    /// Resolves when every currently-registered entity and every active
    /// consumer has asserted.
    pub async fn complete_configuration(&self) -> Result<(), AmqpError> {
        self.inner.complete_configuration().await
    }

    /// Deletes the declared topology: bindings first, then consumers and
    /// queues, then exchanges, respecting the broker's referential
    /// constraints.
    pub async fn delete_configuration(&self) -> Result<(), AmqpError> {
        let bindings: Vec<Binding> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.bindings.values().cloned().collect()
        };
        for binding in bindings {
            binding.delete().await?;
        }

        let queues: Vec<Queue> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.queues.values().cloned().collect()
        };
        for queue in queues {
            queue.stop_consumer().await?;
            queue.delete().await?;
        }

        let exchanges: Vec<Exchange> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.exchanges.values().cloned().collect()
        };
        for exchange in exchanges {
            exchange.delete().await?;
        }
        Ok(())
    }

    /// Closes the connection for good: awaits the current readiness, then
    /// closes the underlying connection. The close event this produces does
    /// not trigger a rebuild.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let latch = {
            let mut state = self.inner.state.lock().unwrap();
            state.is_closing = true;
            state.initialized.clone()
        };
        latch.wait().await?;

        let handle = self.inner.state.lock().unwrap().handle.take();
        if let Some(handle) = handle {
            handle.close().await?;
        }

        self.inner.state.lock().unwrap().initialized =
            Latch::failed(AmqpError::ConnectionClosing);
        Ok(())
    }

    /// The registered exchange with this name, if any.
    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.inner.registry.lock().unwrap().exchanges.get(name).cloned()
    }

    /// The registered queue with this name, if any.
    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.inner.registry.lock().unwrap().queues.get(name).cloned()
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.exchanges.keys().cloned().collect()
        };
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.queues.keys().cloned().collect()
        };
        names.sort();
        names
    }

    pub fn binding_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.bindings.keys().cloned().collect()
        };
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("url", &self.inner.url).finish()
    }
}
