// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bindings
//!
//! A binding is a directed routing relationship from a source exchange to a
//! destination exchange or queue. Destinations are a tagged variant rather
//! than a trait object: binding initialization and message routing both
//! discriminate on the tag. Bindings register themselves under a derived
//! identity; two bindings with the same identity overwrite each other.

use crate::{
    broker::{Arguments, BrokerChannel},
    connection::ConnectionInner,
    errors::AmqpError,
    exchange::Exchange,
    node::{claim_terminal, Node},
    queue::Queue,
    readiness::Latch,
};
use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};
use tracing::{debug, error};

/// Where a message or binding points: a declared exchange or queue.
#[derive(Clone, Debug)]
pub enum Destination {
    Exchange(Exchange),
    Queue(Queue),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Exchange(exchange) => exchange.name(),
            Destination::Queue(queue) => queue.name(),
        }
    }

    /// Readiness of the current incarnation of the underlying node.
    pub fn initialized(&self) -> Latch {
        match self {
            Destination::Exchange(exchange) => exchange.initialized(),
            Destination::Queue(queue) => queue.initialized(),
        }
    }

    pub(crate) fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self {
            Destination::Exchange(exchange) => exchange.channel(),
            Destination::Queue(queue) => queue.channel(),
        }
    }

    pub(crate) fn connection(&self) -> Option<Arc<ConnectionInner>> {
        match self {
            Destination::Exchange(exchange) => exchange.connection(),
            Destination::Queue(queue) => queue.connection(),
        }
    }

}

impl From<&Exchange> for Destination {
    fn from(exchange: &Exchange) -> Self {
        Destination::Exchange(exchange.clone())
    }
}

impl From<&Queue> for Destination {
    fn from(queue: &Queue) -> Self {
        Destination::Queue(queue.clone())
    }
}

/// Derives the registry identity of a binding.
fn binding_id(source: &str, destination: &str, destination_is_queue: bool, pattern: &str) -> String {
    let kind = if destination_is_queue { "Queue" } else { "Exchange" };
    format!("[{}]to{}[{}]{}", source, kind, destination, pattern)
}

struct BindingState {
    initialized: Latch,
    deleting: Option<Latch>,
}

pub(crate) struct BindingInner {
    source: Exchange,
    destination: Destination,
    pattern: String,
    args: Arguments,
    connection: Weak<ConnectionInner>,
    state: Mutex<BindingState>,
}

/// A registered routing relationship from a source exchange to a
/// destination exchange or queue.
#[derive(Clone)]
pub struct Binding {
    inner: Arc<BindingInner>,
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Binding {}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("id", &self.id()).finish()
    }
}

impl Binding {
    /// Registers a binding and starts asserting it against the broker.
    ///
    /// The source must be an exchange; queues cannot route messages onward.
    pub fn declare(
        destination: Destination,
        source: Destination,
        pattern: impl Into<String>,
        args: Arguments,
    ) -> Result<Binding, AmqpError> {
        let source = match source {
            Destination::Exchange(source) => source,
            other => {
                return Err(AmqpError::InvalidBindingSource(other.name().to_owned()));
            }
        };
        let conn = source.connection().ok_or(AmqpError::ConnectionClosing)?;

        let binding = Binding {
            inner: Arc::new(BindingInner {
                source,
                destination,
                pattern: pattern.into(),
                args,
                connection: Arc::downgrade(&conn),
                state: Mutex::new(BindingState {
                    initialized: Latch::new(),
                    deleting: None,
                }),
            }),
        };

        conn.register_binding(binding.clone());
        binding.kickoff();
        Ok(binding)
    }

    /// The derived identity a binding with these endpoints registers under.
    pub fn derive_id(destination: &Destination, source_name: &str, pattern: &str) -> String {
        binding_id(
            source_name,
            destination.name(),
            matches!(destination, Destination::Queue(_)),
            pattern,
        )
    }

    pub fn id(&self) -> String {
        Binding::derive_id(&self.inner.destination, self.inner.source.name(), &self.inner.pattern)
    }

    pub fn source(&self) -> &Exchange {
        &self.inner.source
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn pattern(&self) -> &str {
        &self.inner.pattern
    }

    pub fn initialized(&self) -> Latch {
        self.inner.state.lock().unwrap().initialized.clone()
    }

    fn kickoff(&self) {
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
            Ok(()) => {
                debug!(
                    "binding queue or exchange: {} to the exchange: {} with the pattern: {}",
                    self.inner.destination.name(),
                    self.inner.source.name(),
                    self.inner.pattern
                );
                latch.resolve();
            }
            Err(err) => {
                error!(error = err.to_string(), binding = self.id(), "error to bind");
                if let Some(conn) = self.inner.connection.upgrade() {
                    conn.unregister_binding(&self.id());
                }
                latch.reject(err);
            }
        }
    }

    /// Binds on the destination's channel, discriminating on its tag.
    async fn assert(&self) -> Result<(), AmqpError> {
        let destination = &self.inner.destination;
        destination.initialized().wait().await?;
        let channel = destination.channel()?;
        match destination {
            Destination::Queue(queue) => {
                channel
                    .bind_queue(
                        queue.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        &self.inner.args,
                    )
                    .await
            }
            Destination::Exchange(exchange) => {
                channel
                    .bind_exchange(
                        exchange.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        &self.inner.args,
                    )
                    .await
            }
        }
    }

    /// Unbinds at the broker and removes the binding from the registry.
    /// Idempotent: repeat calls settle with the first call's outcome.
    pub async fn delete(&self) -> Result<(), AmqpError> {
        let (latch, first) = {
            let mut state = self.inner.state.lock().unwrap();
            claim_terminal(&mut state.deleting)
        };
        if !first {
            return latch.wait().await;
        }

        let result = self.teardown().await;
        latch.settle(result.clone());
        result
    }

    async fn teardown(&self) -> Result<(), AmqpError> {
        let destination = &self.inner.destination;
        destination.initialized().wait().await?;
        let channel = destination.channel()?;
        match destination {
            Destination::Queue(queue) => {
                channel
                    .unbind_queue(
                        queue.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        &self.inner.args,
                    )
                    .await?
            }
            Destination::Exchange(exchange) => {
                channel
                    .unbind_exchange(
                        exchange.name(),
                        self.inner.source.name(),
                        &self.inner.pattern,
                        &self.inner.args,
                    )
                    .await?
            }
        }
        if let Some(conn) = self.inner.connection.upgrade() {
            conn.unregister_binding(&self.id());
        }
        Ok(())
    }

    /// True when `node` is this binding's source or destination.
    pub(crate) fn touches(&self, node: &Destination) -> bool {
        match node {
            Destination::Exchange(exchange) => {
                self.inner.source == *exchange
                    || matches!(&self.inner.destination, Destination::Exchange(d) if d == exchange)
            }
            Destination::Queue(queue) => {
                matches!(&self.inner.destination, Destination::Queue(d) if d == queue)
            }
        }
    }

    /// Deletes every registered binding whose source or destination is
    /// `node`. Invoked by exchange and queue teardown to keep the registry
    /// consistent.
    pub(crate) async fn remove_bindings_containing(
        conn: &Arc<ConnectionInner>,
        node: &Destination,
    ) -> Result<(), AmqpError> {
        let touching = conn.bindings_containing(node);
        for binding in touching {
            binding.delete().await?;
        }
        Ok(())
    }
}
