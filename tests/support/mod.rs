//! In-memory broker used by the scenario tests.
//!
//! Implements the broker capability traits over plain maps: declared
//! exchanges, queues, and bindings live in shared state, publishes are
//! routed by exchange kind and binding pattern straight into consumer
//! streams, and the direct-reply-to pseudo queue loops responses back to
//! every registered reply consumer. Connect failures and connection-level
//! events are scriptable from the test body.

#![allow(dead_code)]

use amqp_topology::{
    broker::{
        Arguments, Broker, BrokerChannel, BrokerConnection, ConnectionEvent, ConsumeOptions,
        Delivery, DeliveryStream, EventReceiver, ExchangeDeclare, MessageProperties, QueueDeclare,
    },
    errors::AmqpError,
    exchange::DIRECT_REPLY_TO,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

struct DeclaredExchange {
    kind: String,
}

struct RouteBinding {
    source: String,
    destination: String,
    to_queue: bool,
    pattern: String,
}

struct ConsumerReg {
    tag: String,
    queue: String,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, DeclaredExchange>,
    queues: HashMap<String, ()>,
    bindings: Vec<RouteBinding>,
    consumers: Vec<ConsumerReg>,
    reply_consumers: Vec<ConsumerReg>,
}

struct ConnState {
    id: u64,
    alive: AtomicBool,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

struct Core {
    state: Mutex<BrokerState>,
    connections: Mutex<Vec<Arc<ConnState>>>,
    fail_all: AtomicBool,
    fail_next: AtomicU32,
    attempts: AtomicU32,
    conn_seq: AtomicU64,
    tag_seq: AtomicU64,
    delivery_seq: AtomicU64,
}

pub struct MockBroker {
    core: Arc<Core>,
}

impl MockBroker {
    pub fn new() -> Arc<MockBroker> {
        Arc::new(MockBroker {
            core: Arc::new(Core {
                state: Mutex::new(BrokerState::default()),
                connections: Mutex::new(Vec::new()),
                fail_all: AtomicBool::new(false),
                fail_next: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
                conn_seq: AtomicU64::new(0),
                tag_seq: AtomicU64::new(0),
                delivery_seq: AtomicU64::new(0),
            }),
        })
    }

    /// Refuse every connect attempt from now on.
    pub fn fail_all_connects(&self, on: bool) {
        self.core.fail_all.store(on, Ordering::SeqCst);
    }

    /// Refuse the next `n` connect attempts, then accept again.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.core.attempts.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }

    /// Fails the newest live connection and emits an `Error` event, like a
    /// broker dying under the client.
    pub fn emit_error(&self, message: &str) {
        if let Some(conn) = self.kill_newest() {
            let _ = conn.event_tx.send(ConnectionEvent::Error(message.to_owned()));
        }
    }

    /// Fails the newest live connection and emits a `Closed` event.
    pub fn emit_close(&self) {
        if let Some(conn) = self.kill_newest() {
            let _ = conn.event_tx.send(ConnectionEvent::Closed);
        }
    }

    /// Fails the newest live connection without any event, so the failure
    /// is only discovered by the next operation on one of its channels.
    pub fn kill_silently(&self) {
        self.kill_newest();
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.core.state.lock().unwrap().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.core.state.lock().unwrap().queues.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<String> {
        self.core
            .state
            .lock()
            .unwrap()
            .exchanges
            .get(name)
            .map(|x| x.kind.clone())
    }

    pub fn binding_count(&self) -> usize {
        self.core.state.lock().unwrap().bindings.len()
    }

    /// Tags of the live consumers on `queue`.
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.core
            .state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.tag.clone())
            .collect()
    }

    fn kill_newest(&self) -> Option<Arc<ConnState>> {
        let conn = {
            let connections = self.core.connections.lock().unwrap();
            connections
                .iter()
                .rev()
                .find(|c| c.alive.load(Ordering::SeqCst))
                .cloned()
        }?;
        kill_connection(&self.core, &conn);
        Some(conn)
    }
}

/// Drops the connection and everything attached to it; consumer senders
/// are removed so their streams end, like channels dying with the socket.
fn kill_connection(core: &Core, conn: &ConnState) {
    conn.alive.store(false, Ordering::SeqCst);
    let mut state = core.state.lock().unwrap();
    state.consumers.retain(|c| c.conn_id != conn.id);
    state.reply_consumers.retain(|c| c.conn_id != conn.id);
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        _url: &str,
        _socket_options: &Arguments,
    ) -> Result<(Arc<dyn BrokerConnection>, EventReceiver), AmqpError> {
        self.core.attempts.fetch_add(1, Ordering::SeqCst);

        if self.core.fail_all.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionFailed("connection refused".to_owned()));
        }
        let pending = self.core.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.core.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(AmqpError::ConnectionFailed("connection refused".to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnState {
            id: self.core.conn_seq.fetch_add(1, Ordering::SeqCst) + 1,
            alive: AtomicBool::new(true),
            event_tx: tx,
        });
        self.core.connections.lock().unwrap().push(conn.clone());

        Ok((
            Arc::new(MockConnection {
                core: self.core.clone(),
                conn,
            }),
            rx,
        ))
    }
}

struct MockConnection {
    core: Arc<Core>,
    conn: Arc<ConnState>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelFailed("connection is dead".to_owned()));
        }
        Ok(Arc::new(MockChannel {
            core: self.core.clone(),
            conn: self.conn.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        kill_connection(&self.core, &self.conn);
        let _ = self.conn.event_tx.send(ConnectionEvent::Closed);
        Ok(())
    }
}

struct MockChannel {
    core: Arc<Core>,
    conn: Arc<ConnState>,
    open: AtomicBool,
}

impl MockChannel {
    fn ensure(&self) -> Result<(), AmqpError> {
        if !self.conn.alive.load(Ordering::SeqCst) || !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelFailed("channel is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn assert_exchange(&self, name: &str, declare: &ExchangeDeclare) -> Result<(), AmqpError> {
        self.ensure()?;
        self.core
            .state
            .lock()
            .unwrap()
            .exchanges
            .entry(name.to_owned())
            .or_insert(DeclaredExchange {
                kind: declare.kind.clone(),
            });
        Ok(())
    }

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure()?;
        if self.core.state.lock().unwrap().exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(AmqpError::AssertionFailed(format!("exchange `{}`: not found", name)))
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure()?;
        let mut state = self.core.state.lock().unwrap();
        state.exchanges.remove(name);
        state
            .bindings
            .retain(|b| b.source != name && (b.to_queue || b.destination != name));
        Ok(())
    }

    async fn assert_queue(&self, name: &str, _declare: &QueueDeclare) -> Result<(), AmqpError> {
        self.ensure()?;
        self.core
            .state
            .lock()
            .unwrap()
            .queues
            .entry(name.to_owned())
            .or_insert(());
        Ok(())
    }

    async fn check_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure()?;
        if self.core.state.lock().unwrap().queues.contains_key(name) {
            Ok(())
        } else {
            Err(AmqpError::AssertionFailed(format!("queue `{}`: not found", name)))
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure()?;
        let mut state = self.core.state.lock().unwrap();
        state.queues.remove(name);
        state
            .bindings
            .retain(|b| !(b.to_queue && b.destination == name));
        state.consumers.retain(|c| c.queue != name);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        _args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.ensure()?;
        let mut state = self.core.state.lock().unwrap();
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::AssertionFailed(format!(
                "binding of queue `{}` to exchange `{}`: not found",
                queue, exchange
            )));
        }
        let exists = state.bindings.iter().any(|b| {
            b.to_queue && b.source == exchange && b.destination == queue && b.pattern == pattern
        });
        if !exists {
            state.bindings.push(RouteBinding {
                source: exchange.to_owned(),
                destination: queue.to_owned(),
                to_queue: true,
                pattern: pattern.to_owned(),
            });
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        _args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.ensure()?;
        self.core.state.lock().unwrap().bindings.retain(|b| {
            !(b.to_queue && b.source == exchange && b.destination == queue && b.pattern == pattern)
        });
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        _args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.ensure()?;
        let mut state = self.core.state.lock().unwrap();
        if !state.exchanges.contains_key(destination) || !state.exchanges.contains_key(source) {
            return Err(AmqpError::AssertionFailed(format!(
                "binding of exchange `{}` to exchange `{}`: not found",
                destination, source
            )));
        }
        state.bindings.push(RouteBinding {
            source: source.to_owned(),
            destination: destination.to_owned(),
            to_queue: false,
            pattern: pattern.to_owned(),
        });
        Ok(())
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        _args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.ensure()?;
        self.core.state.lock().unwrap().bindings.retain(|b| {
            !(!b.to_queue
                && b.source == source
                && b.destination == destination
                && b.pattern == pattern)
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.ensure()
            .map_err(|err| AmqpError::PublishFailed(err.to_string()))?;

        let targets = {
            let state = self.core.state.lock().unwrap();
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(AmqpError::PublishFailed(format!(
                    "no exchange `{}`",
                    exchange
                )));
            }
            let mut targets = Vec::new();
            route(&state, exchange, routing_key, &mut targets, 0);
            targets
        };

        for tx in targets {
            let delivery = Delivery {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                delivery_tag: self.core.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1,
                properties: properties.clone(),
                body: body.to_vec(),
            };
            let _ = tx.send(delivery);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: &ConsumeOptions,
    ) -> Result<(String, DeliveryStream), AmqpError> {
        self.ensure()
            .map_err(|_| AmqpError::ConsumeFailed(queue.to_owned()))?;

        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let tag = format!(
            "amq.ctag-{}",
            self.core.tag_seq.fetch_add(1, Ordering::SeqCst) + 1
        );

        {
            let mut state = self.core.state.lock().unwrap();
            let reg = ConsumerReg {
                tag: tag.clone(),
                queue: queue.to_owned(),
                conn_id: self.conn.id,
                tx,
            };
            if queue == DIRECT_REPLY_TO {
                state.reply_consumers.push(reg);
            } else {
                if !state.queues.contains_key(queue) {
                    return Err(AmqpError::ConsumeFailed(queue.to_owned()));
                }
                state.consumers.push(reg);
            }
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok((tag, Box::pin(stream)))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure()?;
        let mut state = self.core.state.lock().unwrap();
        state.consumers.retain(|c| c.tag != consumer_tag);
        state.reply_consumers.retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn prefetch(&self, _count: u16) -> Result<(), AmqpError> {
        self.ensure()
    }

    async fn recover(&self) -> Result<(), AmqpError> {
        self.ensure()
    }

    async fn ack(&self, _delivery_tag: u64, _multiple: bool) -> Result<(), AmqpError> {
        self.ensure()
    }

    async fn nack(
        &self,
        _delivery_tag: u64,
        _multiple: bool,
        _requeue: bool,
    ) -> Result<(), AmqpError> {
        self.ensure()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects the consumer senders a publish should reach.
fn route(
    state: &BrokerState,
    exchange: &str,
    routing_key: &str,
    out: &mut Vec<mpsc::UnboundedSender<Delivery>>,
    depth: u8,
) {
    if depth > 4 {
        return;
    }

    if exchange.is_empty() {
        if routing_key.starts_with(DIRECT_REPLY_TO) {
            out.extend(state.reply_consumers.iter().map(|c| c.tx.clone()));
            return;
        }
        out.extend(
            state
                .consumers
                .iter()
                .filter(|c| c.queue == routing_key)
                .map(|c| c.tx.clone()),
        );
        return;
    }

    let Some(declared) = state.exchanges.get(exchange) else {
        return;
    };
    for binding in state
        .bindings
        .iter()
        .filter(|b| b.source == exchange && kind_matches(&declared.kind, &b.pattern, routing_key))
    {
        if binding.to_queue {
            out.extend(
                state
                    .consumers
                    .iter()
                    .filter(|c| c.queue == binding.destination)
                    .map(|c| c.tx.clone()),
            );
        } else {
            route(state, &binding.destination, routing_key, out, depth + 1);
        }
    }
}

fn kind_matches(kind: &str, pattern: &str, routing_key: &str) -> bool {
    match kind {
        "fanout" | "headers" => true,
        "topic" => topic_matches(pattern, routing_key),
        _ => pattern == routing_key,
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&key_word)) if word == key_word => {
                matches(&pattern[1..], &key[1..])
            }
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards_match_like_the_broker() {
        assert!(topic_matches("a.*", "a.b"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("a.#", "a"));
        assert!(!topic_matches("a.b", "a.c"));
    }
}
