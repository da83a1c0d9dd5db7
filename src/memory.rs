//! In-process broker with exchange/queue/binding semantics.
//!
//! Used by the test suite and the demos. It enforces the same rules a real
//! broker does for this system: idempotent declarations, conflicts on
//! mismatched parameters, broker-side TTL and max-length eviction, and
//! auto-ack consumption. Fault injection hooks let callers make the broker
//! unreachable or drop every open connection.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerChannel, ConnectOptions, Delivery, DeliveryStream, MessageProperties};
use crate::error::BrokerError;
use crate::topology::{ExchangeKind, ExchangeSpec, QueueSpec, WILDCARD_ROUTING_KEY};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    unavailable: AtomicBool,
    connect_attempts: AtomicU64,
    published: AtomicU64,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingEntry>,
    connections: Vec<CancellationToken>,
}

struct BindingEntry {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<(Instant, Delivery)>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn evict_expired(&mut self, now: Instant) {
        let ttl = self.spec.args.message_ttl;
        while let Some((enqueued_at, _)) = self.messages.front() {
            if now.duration_since(*enqueued_at) >= ttl {
                self.messages.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, delivery: Delivery) {
        let now = Instant::now();
        self.evict_expired(now);
        self.messages.push_back((now, delivery));
        while self.messages.len() > self.spec.args.max_length as usize {
            self.messages.pop_front();
        }
        self.notify.notify_one();
    }

    fn pop(&mut self) -> Option<Delivery> {
        self.evict_expired(Instant::now());
        self.messages.pop_front().map(|(_, d)| d)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Drop every open connection, as a broker restart would.
    pub fn kill_connections(&self) {
        let connections = std::mem::take(&mut self.state().connections);
        for token in connections {
            token.cancel();
        }
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of messages accepted by an exchange.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|t| !t.is_cancelled())
            .count()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain collections behind;
        // they are still consistent enough for a test broker.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        url: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!("{url}: connection refused")));
        }
        let closed = CancellationToken::new();
        let mut state = self.state();
        state.connections.retain(|t| !t.is_cancelled());
        state.connections.push(closed.clone());
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            closed,
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    closed: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

fn routing_matches(kind: ExchangeKind, pattern: &str, key: &str) -> bool {
    if pattern == WILDCARD_ROUTING_KEY {
        return true;
    }
    match kind {
        ExchangeKind::Direct => pattern == key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BrokerError::TopologyConflict {
                entity: format!("exchange {}", exchange.name),
                reason: format!(
                    "declared as {} (durable={}), requested {} (durable={})",
                    existing.kind, existing.durable, exchange.kind, exchange.durable
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(BrokerError::TopologyConflict {
                entity: format!("queue {}", queue.name),
                reason: format!("declared with {:?}, requested {:?}", existing.spec, queue),
            }),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        messages: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::TopologyConflict {
                entity: format!("exchange {exchange}"),
                reason: "binding to an undeclared exchange".to_string(),
            });
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::TopologyConflict {
                entity: format!("queue {queue}"),
                reason: "binding an undeclared queue".to_string(),
            });
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(BindingEntry {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let kind = match state.exchanges.get(exchange) {
            Some(spec) => spec.kind,
            None => return Err(BrokerError::Publish(format!("no exchange {exchange}"))),
        };

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && routing_matches(kind, &b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            body,
            properties,
        };
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.push(delivery.clone());
            }
        }
        self.broker.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.ensure_open()?;
        let notify = match self.broker.state().queues.get(queue) {
            Some(q) => Arc::clone(&q.notify),
            None => {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: "queue not declared".to_string(),
                })
            }
        };
        Ok(Box::new(MemoryDeliveryStream {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            notify,
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        Ok(())
    }
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    queue: String,
    notify: Arc<Notify>,
    closed: CancellationToken,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self
                .broker
                .state()
                .queues
                .get_mut(&self.queue)
                .and_then(|q| q.pop());
            if let Some(delivery) = next {
                return Some(Ok(delivery));
            }

            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}
