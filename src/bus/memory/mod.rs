//! In-memory broker for standalone mode and tests.
//!
//! Implements the subset of AMQP 0-9-1 semantics the delivery pipeline relies
//! on, inside a single process:
//! - topic and direct exchanges, durable-argument equivalence checks
//! - mandatory publishes returned with `312 NO_ROUTE` when nothing matches
//! - per-consumer prefetch
//! - reject without requeue forwards to the queue's dead-letter exchange
//! - closing a consumer returns its unacknowledged deliveries to the queue
//!   head, flagged as redelivered
//! - losing the connection fails every open consumer stream

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerConfirm, BusError, Consumer, Delivery, DeliveryAcker, OutboundMessage,
    PendingConfirm, Result, ReturnedMessage, Transport,
};
use crate::topology::{topic_matches, BindingSpec, ExchangeSpec, ExchangeType, QueueSpec};

/// Reply code for a mandatory message that matched no binding.
pub const NO_ROUTE: u16 = 312;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub death_count: u32,
}

struct Unacked {
    message: QueuedMessage,
    consumer_id: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    next_tag: u64,
    next_consumer: u64,
}

impl BrokerState {
    /// Route a message through an exchange. `None` if the exchange does not
    /// exist, otherwise the number of queues that received a copy.
    fn route(&mut self, exchange: &str, routing_key: &str, message: QueuedMessage) -> Option<usize> {
        let kind = self.exchanges.get(exchange)?.kind;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeType::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeType::Direct => b.routing_key == routing_key,
            })
            .map(|b| b.queue.clone())
            .collect();

        let mut delivered = 0;
        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_back(message.clone());
                state.notify.notify_waiters();
                delivered += 1;
            }
        }
        Some(delivered)
    }

    /// Forward a rejected message through the queue's dead-letter exchange.
    fn dead_letter(&mut self, queue: &str, mut message: QueuedMessage) {
        let Some(dl) = self.queues.get(queue).and_then(|q| q.spec.dead_letter.clone()) else {
            debug!(queue = %queue, "Rejected message dropped, queue has no dead-letter exchange");
            return;
        };

        message.death_count += 1;
        message.redelivered = false;
        message.exchange = dl.exchange.clone();
        message.routing_key = dl.routing_key.clone();

        match self.route(&dl.exchange, &dl.routing_key, message) {
            Some(0) | None => warn!(
                queue = %queue,
                dead_letter_exchange = %dl.exchange,
                dead_letter_routing_key = %dl.routing_key,
                "Dead-lettered message matched no queue and was dropped"
            ),
            Some(_) => debug!(
                queue = %queue,
                dead_letter_exchange = %dl.exchange,
                "Message dead-lettered"
            ),
        }
    }
}

/// In-process broker. Cheap to clone handles via `Arc`.
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    reachable: Arc<AtomicBool>,
    send_attempts: AtomicUsize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            reachable: Arc::new(AtomicBool::new(true)),
            send_attempts: AtomicUsize::new(0),
        }
    }

    /// Simulate the broker going away (or coming back).
    ///
    /// Going away fails the stream of every open consumer, like a dropped
    /// connection. Their unacknowledged deliveries stay outstanding until the
    /// consumer is closed.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            wake_all_consumers(&self.state);
        }
    }

    /// Number of `send` calls made, reachable or not.
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Ready plus unacknowledged messages, or `None` for an unknown queue.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = lock(&self.state);
        state.queues.get(queue).map(|q| q.ready.len() + q.unacked.len())
    }

    /// Snapshot of the messages waiting in a queue, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        let state = lock(&self.state);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Connection(
                "Connection refused: broker unreachable".to_string(),
            ))
        }
    }
}

fn wake_all_consumers(state: &Mutex<BrokerState>) {
    let state = lock(state);
    for queue in state.queues.values() {
        queue.notify.notify_waiters();
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn send(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;

        let queued = QueuedMessage {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.payload.clone(),
            message_id: Some(message.message_id.clone()),
            redelivered: false,
            death_count: 0,
        };

        let confirm = {
            let mut state = lock(&self.state);
            match state.route(&message.exchange, &message.routing_key, queued) {
                None => BrokerConfirm::Nack {
                    cause: Some(format!(
                        "NOT_FOUND - no exchange '{}' in vhost '/'",
                        message.exchange
                    )),
                },
                Some(0) if message.mandatory => BrokerConfirm::Returned(ReturnedMessage {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                    message_id: Some(message.message_id),
                    payload: message.payload,
                }),
                Some(_) => BrokerConfirm::Ack,
            }
        };

        Ok(Box::pin(futures::future::ready(Ok::<_, BusError>(confirm))))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing.kind != spec.kind {
                return Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    spec.name, spec.kind, existing.kind
                )));
            }
            if existing.durable != spec.durable {
                return Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}'",
                    spec.name
                )));
            }
            return Ok(());
        }

        state.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = lock(&self.state);

        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec.durable != spec.durable {
                return Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    spec.name
                )));
            }
            if existing.spec.dead_letter != spec.dead_letter {
                return Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{}'",
                    spec.name
                )));
            }
            return Ok(());
        }

        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = lock(&self.state);

        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no exchange '{}' in vhost '/'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no queue '{}' in vhost '/'",
                binding.queue
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Consumer>> {
        self.ensure_reachable()?;
        let mut state = lock(&self.state);

        let notify = state
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| {
                BusError::Subscribe(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue))
            })?;

        state.next_consumer += 1;
        let consumer_id = state.next_consumer;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "In-memory consumer started");

        Ok(Box::new(MemoryConsumer {
            state: self.state.clone(),
            reachable: self.reachable.clone(),
            queue: queue.to_string(),
            consumer_id,
            prefetch: usize::from(prefetch),
            notify,
            cancelled: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.set_reachable(false);
        info!("In-memory broker closed");
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<Mutex<BrokerState>>,
    reachable: Arc<AtomicBool>,
    queue: String,
    consumer_id: u64,
    /// Zero means unlimited.
    prefetch: usize,
    notify: Arc<Notify>,
    cancelled: bool,
}

impl MemoryConsumer {
    fn try_take(&self) -> Option<Delivery> {
        let mut state = lock(&self.state);
        state.next_tag += 1;
        let tag = state.next_tag;

        let queue = state.queues.get_mut(&self.queue)?;
        if self.prefetch > 0 {
            let outstanding = queue
                .unacked
                .values()
                .filter(|u| u.consumer_id == self.consumer_id)
                .count();
            if outstanding >= self.prefetch {
                return None;
            }
        }

        let message = queue.ready.pop_front()?;
        queue.unacked.insert(
            tag,
            Unacked {
                message: message.clone(),
                consumer_id: self.consumer_id,
            },
        );

        Some(Delivery {
            queue: self.queue.clone(),
            exchange: message.exchange,
            routing_key: message.routing_key,
            delivery_tag: tag,
            body: message.body,
            message_id: message.message_id,
            redelivered: message.redelivered,
            death_count: (message.death_count > 0).then_some(message.death_count),
            acker: Arc::new(MemoryAcker {
                state: self.state.clone(),
                queue: self.queue.clone(),
                tag,
            }),
        })
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Result<Delivery>> {
        loop {
            if self.cancelled {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.reachable.load(Ordering::SeqCst) {
                // The stream is dead; a fresh consumer is needed.
                self.cancelled = true;
                return Some(Err(BusError::Connection(format!(
                    "Connection lost while consuming '{}'",
                    self.queue
                ))));
            }

            if let Some(delivery) = self.try_take() {
                return Some(Ok(delivery));
            }

            notified.await;
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.cancelled = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.cancelled = true;
        let mut state = lock(&self.state);
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.consumer_id == self.consumer_id)
                .map(|(tag, _)| *tag)
                .collect();
            // Highest tag first so the oldest delivery ends up at the head.
            tags.sort_unstable_by(|a, b| b.cmp(a));

            for tag in &tags {
                if let Some(unacked) = queue.unacked.remove(tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            if !tags.is_empty() {
                debug!(queue = %self.queue, returned = tags.len(), "Unacked deliveries returned to queue");
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState) -> Result<QueuedMessage> {
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::Ack(format!("queue '{}' no longer exists", self.queue)))?;
        let unacked = queue.unacked.remove(&self.tag).ok_or_else(|| {
            BusError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            ))
        })?;
        queue.notify.notify_waiters();
        Ok(unacked.message)
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = lock(&self.state);
        self.take(&mut state).map(|_| ())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let mut state = lock(&self.state);
        let mut message = self.take(&mut state)?;

        if requeue {
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.ready.push_front(message);
                queue.notify.notify_waiters();
            }
        } else {
            state.dead_letter(&self.queue, message);
        }
        Ok(())
    }
}
