// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker living entirely inside the process. It is the reference implementation
//! of the delivery semantics the patterns rely on:
//!
//! - publishes are routed through [`crate::router::route`], the default exchange
//!   routes by queue name;
//! - queues are FIFO and hand messages round robin to consumers that still have
//!   prefetch capacity;
//! - unacked deliveries stay with their consumer until acked, rejected, or the
//!   consumer's session ends, then go back to the head of the queue flagged as
//!   redelivered;
//! - exclusive queues belong to one session and are deleted with it;
//! - [`MemoryBroker::restart`] keeps durable queues and exchanges and the persistent
//!   messages in them, everything else is lost.
//!
//! Each [`MemorySession`] stands for one connection. All sessions of a broker share
//! its state behind a single mutex; no lock is held across an await point.

use crate::{
    broker::{Broker, ConsumeOptions, Consumer},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    message::{Delivery, Message, MAX_ROUTING_KEY_LEN},
    queue::{QueueBinding, QueueDefinition, GENERATED_QUEUE_PREFIX},
    router::{route, BindingTable},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

type SessionId = u64;

/// An in-process broker. Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session (the equivalent of a connection plus channel).
    pub fn connect(&self) -> MemorySession {
        let mut state = lock(&self.state);
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id);
        debug!(session = id, "session opened");

        MemorySession {
            id,
            state: self.state.clone(),
        }
    }

    /// Simulates a broker restart.
    ///
    /// Every session is dropped and every consumer stream ends. Durable exchanges,
    /// durable non-exclusive queues, the bindings between them, and the persistent
    /// messages of those queues (including unacked ones) survive.
    pub fn restart(&self) {
        lock(&self.state).restart();
    }

    /// Number of messages waiting for delivery, `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered but unacknowledged messages of a queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Unacknowledged deliveries held by one consumer.
    pub fn in_flight(&self, consumer_tag: &str) -> usize {
        lock(&self.state)
            .consumers
            .get(consumer_tag)
            .map_or(0, |c| c.in_flight)
    }

    /// Snapshot of the messages waiting in a queue, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Message> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        lock(&self.state).exchanges.contains_key(exchange)
    }
}

/// One connection to a [`MemoryBroker`].
///
/// Dropping the session closes it.
pub struct MemorySession {
    id: SessionId,
    state: Arc<Mutex<BrokerState>>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = lock(&self.state);
        if state.sessions.contains(&self.id) {
            Ok(state)
        } else {
            Err(AmqpError::SessionClosed)
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        lock(&self.state).close_session(self.id);
    }
}

#[async_trait]
impl Broker for MemorySession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state()?.declare_exchange(def)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.state()?.declare_queue(self.id, def)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.state()?.bind_queue(self.id, binding)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        state.owned_queue(self.id, name)?;
        state.remove_queue(name);
        debug!(queue = name, "queue deleted");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), AmqpError> {
        self.state()?.publish(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, AmqpError> {
        let (tag, receiver) = self.state()?.consume(self.id, queue, options)?;

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });

        Ok(Consumer::new(tag, queue.to_owned(), deliveries.boxed()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state()?.settle(self.id, delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state()?
            .settle(self.id, delivery_tag, Settlement::Reject { requeue })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        lock(&self.state).close_session(self.id);
        Ok(())
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
    unacked: BTreeMap<u64, Unacked>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    next_tag: u64,
    next_consumer: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: BindingTable,
}

struct QueueState {
    durable: bool,
    auto_delete: bool,
    owner: Option<SessionId>,
    ttl: Option<Duration>,
    max_length: Option<usize>,
    ready: VecDeque<Envelope>,
    consumers: Vec<String>,
    cursor: usize,
}

impl QueueState {
    fn new(owner: Option<SessionId>, def: &QueueDefinition) -> Self {
        QueueState {
            durable: def.durable,
            auto_delete: def.delete,
            owner,
            ttl: def.ttl,
            max_length: def.max_length,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Next consumer in round robin order that may receive another delivery.
    fn next_consumer(&mut self, consumers: &HashMap<String, ConsumerState>) -> Option<String> {
        let count = self.consumers.len();
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            let tag = &self.consumers[idx];
            if consumers.get(tag).is_some_and(ConsumerState::has_capacity) {
                self.cursor = (idx + 1) % count;
                return Some(tag.clone());
            }
        }
        None
    }
}

struct ConsumerState {
    session: SessionId,
    queue: String,
    prefetch: u16,
    auto_ack: bool,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Clone)]
struct Envelope {
    exchange: String,
    routing_key: String,
    message: Message,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl Envelope {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn requeued(mut self) -> Self {
        self.redelivered = true;
        self
    }

    fn delivery(&self, delivery_tag: u64, consumer_tag: &str) -> Delivery {
        Delivery {
            delivery_tag,
            consumer_tag: consumer_tag.to_owned(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            message: self.message.clone(),
        }
    }
}

struct Unacked {
    session: SessionId,
    consumer_tag: String,
    queue: String,
    envelope: Envelope,
}

impl BrokerState {
    fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name == DEFAULT_EXCHANGE {
            return Err(AmqpError::PreconditionFailed(
                "the default exchange cannot be redeclared".to_owned(),
            ));
        }

        if let Some(existing) = self.exchanges.get(&def.name) {
            if existing.kind != def.kind && !def.passive {
                warn!(
                    name = def.name,
                    declared = %existing.kind,
                    requested = %def.kind,
                    "exchange redeclared with another type"
                );
                return Err(AmqpError::PreconditionFailed(format!(
                    "exchange `{}` is of type {}",
                    def.name, existing.kind
                )));
            }
            return Ok(());
        }

        if def.passive {
            return Err(AmqpError::ExchangeNotFound(def.name.clone()));
        }

        self.exchanges.insert(
            def.name.clone(),
            ExchangeState {
                kind: def.kind,
                durable: def.durable,
                bindings: BindingTable::new(),
            },
        );
        debug!(name = def.name, kind = %def.kind, "exchange declared");
        Ok(())
    }

    fn declare_queue(&mut self, session: SessionId, def: &QueueDefinition) -> Result<String, AmqpError> {
        let name = if def.name.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple())
        } else {
            def.name.clone()
        };

        if self.queues.contains_key(&name) {
            self.owned_queue(session, &name)?;
            return Ok(name);
        }

        if def.passive {
            return Err(AmqpError::QueueNotFound(name));
        }

        let owner = def.exclusive.then_some(session);
        self.queues.insert(name.clone(), QueueState::new(owner, def));
        debug!(name, durable = def.durable, exclusive = def.exclusive, "queue declared");
        Ok(name)
    }

    /// Fails unless the queue exists and is usable by `session`.
    fn owned_queue(&self, session: SessionId, name: &str) -> Result<(), AmqpError> {
        match self.queues.get(name) {
            None => Err(AmqpError::QueueNotFound(name.to_owned())),
            Some(queue) if queue.owner.is_some_and(|owner| owner != session) => {
                Err(AmqpError::ExclusiveQueueLocked(name.to_owned()))
            }
            Some(_) => Ok(()),
        }
    }

    fn bind_queue(&mut self, session: SessionId, binding: &QueueBinding) -> Result<(), AmqpError> {
        if binding.exchange_name == DEFAULT_EXCHANGE {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        self.owned_queue(session, &binding.queue_name)?;

        let exchange = self
            .exchanges
            .get_mut(&binding.exchange_name)
            .ok_or_else(|| AmqpError::ExchangeNotFound(binding.exchange_name.clone()))?;
        exchange
            .bindings
            .bind(&binding.queue_name, &binding.routing_key);

        debug!(
            queue = binding.queue_name,
            exchange = binding.exchange_name,
            key = binding.routing_key,
            "queue bound"
        );
        Ok(())
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, message: Message) -> Result<(), AmqpError> {
        if routing_key.len() > MAX_ROUTING_KEY_LEN {
            debug!(exchange, len = routing_key.len(), "routing key too long, message dropped");
            return Ok(());
        }

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let state = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;
            route(&state.kind, &state.bindings, routing_key)
                .into_iter()
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, key = routing_key, "unroutable message dropped");
            return Ok(());
        }

        let now = Instant::now();
        for target in targets {
            let Some(queue) = self.queues.get_mut(&target) else {
                continue;
            };

            let ttl = match (queue.ttl, message.properties.expiration) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            queue.ready.push_back(Envelope {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message: message.clone(),
                redelivered: false,
                expires_at: ttl.map(|ttl| now + ttl),
            });

            if let Some(max) = queue.max_length {
                while queue.ready.len() > max {
                    queue.ready.pop_front();
                    debug!(queue = target, "queue full, dropping oldest message");
                }
            }

            self.dispatch(&target);
        }

        Ok(())
    }

    fn consume(
        &mut self,
        session: SessionId,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<(String, mpsc::UnboundedReceiver<Delivery>), AmqpError> {
        self.owned_queue(session, queue)?;

        self.next_consumer += 1;
        let tag = format!("ctag-{}", self.next_consumer);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.consumers.insert(
            tag.clone(),
            ConsumerState {
                session,
                queue: queue.to_owned(),
                prefetch: options.prefetch,
                auto_ack: options.auto_ack,
                in_flight: 0,
                sender,
            },
        );
        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.push(tag.clone());
        }
        debug!(queue, consumer = tag, prefetch = options.prefetch, "consumer started");

        self.dispatch(queue);
        Ok((tag, receiver))
    }

    fn settle(&mut self, session: SessionId, delivery_tag: u64, settlement: Settlement) -> Result<(), AmqpError> {
        if !self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.session == session)
        {
            return Err(AmqpError::UnknownDeliveryTag(delivery_tag));
        }
        let Some(unacked) = self.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::UnknownDeliveryTag(delivery_tag));
        };

        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        if let Settlement::Reject { requeue: true } = settlement {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.envelope.requeued());
            }
        }

        self.dispatch(&unacked.queue);
        Ok(())
    }

    /// Pushes ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, name: &str) {
        let now = Instant::now();
        if let Some(queue) = self.queues.get_mut(name) {
            let before = queue.ready.len();
            queue.ready.retain(|envelope| !envelope.is_expired(now));
            if queue.ready.len() != before {
                debug!(queue = name, expired = before - queue.ready.len(), "expired messages dropped");
            }
        }

        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }
            let Some(consumer_tag) = queue.next_consumer(&self.consumers) else {
                return;
            };
            let Some(consumer) = self.consumers.get_mut(&consumer_tag) else {
                return;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let delivery_tag = self.next_tag;

            if consumer
                .sender
                .send(envelope.delivery(delivery_tag, &consumer_tag))
                .is_err()
            {
                debug!(consumer = consumer_tag, "consumer went away, requeuing");
                queue.ready.push_front(envelope);
                self.remove_consumer(&consumer_tag);
                continue;
            }

            if !consumer.auto_ack {
                consumer.in_flight += 1;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        session: consumer.session,
                        consumer_tag,
                        queue: name.to_owned(),
                        envelope,
                    },
                );
            }
        }
    }

    /// Cancels a consumer, handing its unacked deliveries back to the queue.
    fn remove_consumer(&mut self, tag: &str) {
        let Some(consumer) = self.consumers.remove(tag) else {
            return;
        };

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer_tag == tag)
            .map(|(delivery_tag, _)| *delivery_tag)
            .collect();

        let Some(queue) = self.queues.get_mut(&consumer.queue) else {
            for delivery_tag in tags {
                self.unacked.remove(&delivery_tag);
            }
            return;
        };

        queue.consumers.retain(|t| t != tag);
        queue.cursor = 0;
        // head of the queue, original order
        for delivery_tag in tags.iter().rev() {
            if let Some(unacked) = self.unacked.remove(delivery_tag) {
                queue.ready.push_front(unacked.envelope.requeued());
            }
        }
        if !tags.is_empty() {
            debug!(consumer = tag, requeued = tags.len(), "unacked messages requeued");
        }

        if queue.auto_delete && queue.consumers.is_empty() {
            self.remove_queue(&consumer.queue);
            return;
        }
        self.dispatch(&consumer.queue);
    }

    fn remove_queue(&mut self, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };

        for exchange in self.exchanges.values_mut() {
            exchange.bindings.unbind_queue(name);
        }
        for tag in &queue.consumers {
            self.consumers.remove(tag);
        }
        self.unacked.retain(|_, u| u.queue != name);
    }

    fn close_session(&mut self, session: SessionId) {
        if !self.sessions.remove(&session) {
            return;
        }

        let consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.session == session)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in consumers {
            self.remove_consumer(&tag);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(session))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }

        debug!(session, "session closed");
    }

    fn restart(&mut self) {
        self.sessions.clear();
        self.consumers.clear();

        let unacked = std::mem::take(&mut self.unacked);
        for (_, unacked) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.envelope.requeued());
            }
        }

        self.queues
            .retain(|_, queue| queue.durable && queue.owner.is_none());
        for queue in self.queues.values_mut() {
            queue.consumers.clear();
            queue.cursor = 0;
            queue
                .ready
                .retain(|envelope| envelope.message.properties.is_persistent());
        }

        self.exchanges.retain(|_, exchange| exchange.durable);
        let queues = &self.queues;
        for exchange in self.exchanges.values_mut() {
            let gone: Vec<String> = exchange
                .bindings
                .queues()
                .filter(|queue| !queues.contains_key(*queue))
                .map(str::to_owned)
                .collect();
            for queue in gone {
                exchange.bindings.unbind_queue(&queue);
            }
        }

        debug!(
            queues = self.queues.len(),
            exchanges = self.exchanges.len(),
            "broker restarted"
        );
    }
}
