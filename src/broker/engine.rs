//! Broker engine
//!
//! This module contains the in-memory broker state responsible for:
//! - managing exchanges, queues, bindings and consumers
//! - routing published messages (default exchange by queue name, direct
//!   exchanges by binding key, fanout to every bound queue)
//! - delivering round-robin within each channel's prefetch limit
//! - tracking unacknowledged deliveries per channel and requeueing them when
//!   the channel or its connection goes away
//! - heartbeat bookkeeping and fault injection for tests
//!
//! Concurrency and usage notes:
//! - `BrokerState` is synchronous and lives behind the mutex in
//!   `MemoryBroker`. Callers never hold the lock across an `.await`.
//! - Delivery happens under the lock by pushing into each consumer's unbounded
//!   channel, so a publish or ack never waits on a slow consumer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::MemoryConnector;
use super::message::{ChannelId, ConnectionId, Operation, OperationKind, StoredMessage};
use super::queue::{Queue, QueueConsumer};
use crate::transport::{
    CloseReason, ConsumeOptions, Delivery, ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec,
};
use crate::utils::error::TransportError;

pub(crate) type ClosedSender = Arc<watch::Sender<Option<CloseReason>>>;

#[derive(Debug)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct ConnectionState {
    closed: ClosedSender,
    channels: HashSet<ChannelId>,
    last_heartbeat: Instant,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    connection: ConnectionId,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    /// consumer tag -> queue name
    consumers: HashMap<String, String>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: u32,
    stalls: Vec<OperationKind>,
}

#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<ConnectionId, ConnectionState>,
    channels: HashMap<ChannelId, ChannelState>,
    next_id: u64,
    connection_attempts: u64,
    faults: Faults,
    operations: Vec<Operation>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn open_connection(&mut self) -> Result<(ConnectionId, ClosedSender), TransportError> {
        self.connection_attempts += 1;
        if self.faults.refuse_connections > 0 {
            self.faults.refuse_connections -= 1;
            return Err(TransportError::ConnectionRefused(
                "broker refused the connection".to_string(),
            ));
        }

        let id = self.next_id();
        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);
        self.connections.insert(
            id,
            ConnectionState {
                closed: Arc::clone(&closed),
                channels: HashSet::new(),
                last_heartbeat: Instant::now(),
            },
        );
        debug!(connection = id, "memory broker accepted connection");
        Ok((id, closed))
    }

    pub(crate) fn connection_open(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    pub(crate) fn open_channel(&mut self, connection: ConnectionId) -> Result<ChannelId, TransportError> {
        if !self.connections.contains_key(&connection) {
            return Err(TransportError::ConnectionClosed);
        }
        let id = self.next_id();
        self.channels.insert(
            id,
            ChannelState {
                connection,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
                consumers: HashMap::new(),
            },
        );
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.channels.insert(id);
        }
        self.operations.push(Operation::OpenChannel { channel: id });
        Ok(id)
    }

    pub(crate) fn channel_open(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    fn channel_connection(&self, channel: ChannelId) -> Result<ConnectionId, TransportError> {
        self.channels
            .get(&channel)
            .map(|ch| ch.connection)
            .ok_or(TransportError::ChannelClosed)
    }

    pub(crate) fn declare_exchange(
        &mut self,
        channel: ChannelId,
        spec: &ExchangeSpec,
    ) -> Result<(), TransportError> {
        self.channel_connection(channel)?;
        if spec.name.is_empty() {
            return Err(TransportError::PreconditionFailed(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }
        if let Some(existing) = self.exchanges.get(&spec.name) {
            if existing.kind != spec.kind {
                return Err(TransportError::PreconditionFailed(format!(
                    "exchange '{}' already declared with another type",
                    spec.name
                )));
            }
        } else {
            self.exchanges.insert(
                spec.name.clone(),
                Exchange {
                    kind: spec.kind,
                    bindings: Vec::new(),
                },
            );
        }
        self.operations.push(Operation::DeclareExchange {
            channel,
            name: spec.name.clone(),
        });
        Ok(())
    }

    pub(crate) fn declare_queue(
        &mut self,
        channel: ChannelId,
        spec: &QueueSpec,
    ) -> Result<String, TransportError> {
        let connection = self.channel_connection(channel)?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        match self.queues.get(&name) {
            Some(existing) => {
                if existing
                    .exclusive_owner
                    .is_some_and(|owner| owner != connection)
                {
                    return Err(TransportError::ResourceLocked(format!(
                        "queue '{name}' is exclusive to another connection"
                    )));
                }
            }
            None => {
                let mut queue = Queue::new(&name);
                queue.durable = spec.durable;
                queue.auto_delete = spec.auto_delete;
                queue.exclusive_owner = spec.exclusive.then_some(connection);
                self.queues.insert(name.clone(), queue);
            }
        }

        self.operations.push(Operation::DeclareQueue {
            channel,
            name: name.clone(),
        });
        Ok(name)
    }

    pub(crate) fn bind_queue(
        &mut self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel_connection(channel)?;
        if exchange.is_empty() {
            return Err(TransportError::PreconditionFailed(
                "queues cannot be bound to the default exchange".to_string(),
            ));
        }
        if !self.queues.contains_key(queue) {
            return Err(TransportError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        let target = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;

        let already_bound = target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !already_bound {
            target.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        self.operations.push(Operation::BindQueue {
            channel,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    pub(crate) fn set_prefetch(&mut self, channel: ChannelId, count: u16) -> Result<(), TransportError> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(TransportError::ChannelClosed)?;
        state.prefetch = count;
        self.operations.push(Operation::SetPrefetch { channel, count });
        self.dispatch_all();
        Ok(())
    }

    pub(crate) fn consume(
        &mut self,
        channel: ChannelId,
        queue_name: &str,
        options: ConsumeOptions,
    ) -> Result<(String, mpsc::UnboundedReceiver<Delivery>), TransportError> {
        let connection = self.channel_connection(channel)?;
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| TransportError::NotFound {
                kind: "queue",
                name: queue_name.to_string(),
            })?;
        if queue
            .exclusive_owner
            .is_some_and(|owner| owner != connection)
        {
            return Err(TransportError::ResourceLocked(format!(
                "queue '{queue_name}' is exclusive to another connection"
            )));
        }
        if options.exclusive && !queue.consumers.is_empty() {
            return Err(TransportError::ResourceLocked(format!(
                "queue '{queue_name}' already has consumers"
            )));
        }

        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        let (sender, receiver) = mpsc::unbounded_channel();
        queue.subscribe(QueueConsumer {
            tag: tag.clone(),
            channel,
            no_ack: options.no_ack,
            sender,
        });
        if let Some(state) = self.channels.get_mut(&channel) {
            state.consumers.insert(tag.clone(), queue_name.to_string());
        }

        self.operations.push(Operation::Consume {
            channel,
            queue: queue_name.to_string(),
        });
        self.dispatch(queue_name);
        Ok((tag, receiver))
    }

    pub(crate) fn cancel(&mut self, channel: ChannelId, tag: &str) -> Result<(), TransportError> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(TransportError::ChannelClosed)?;
        let queue_name = state
            .consumers
            .remove(tag)
            .ok_or_else(|| TransportError::NotFound {
                kind: "consumer",
                name: tag.to_string(),
            })?;
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.unsubscribe(tag);
        }
        self.remove_if_auto_delete(&queue_name);
        self.operations.push(Operation::Cancel {
            channel,
            tag: tag.to_string(),
        });
        Ok(())
    }

    /// Routes a message. `channel` is `None` for messages injected directly
    /// through [`MemoryBroker::publish`].
    pub(crate) fn publish(
        &mut self,
        channel: Option<ChannelId>,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        if let Some(channel) = channel {
            self.channel_connection(channel)?;
        }
        let targets = self.route(&message.exchange, &message.routing_key)?;
        if targets.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "unroutable message dropped"
            );
        }

        self.operations.push(Operation::Publish {
            channel,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
        });
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.enqueue(StoredMessage {
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(&target);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let exchange_state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        let mut targets: Vec<String> = Vec::new();
        for binding in &exchange_state.bindings {
            let matches = match exchange_state.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
            };
            if matches && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    pub(crate) fn ack(&mut self, channel: ChannelId, delivery_tag: u64) -> Result<(), TransportError> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(TransportError::ChannelClosed)?;
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(TransportError::PreconditionFailed(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        }
        self.operations.push(Operation::Ack {
            channel,
            delivery_tag,
        });
        self.dispatch_all();
        Ok(())
    }

    /// Push ready messages of one queue to consumers with spare capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.messages.is_empty() {
            let channels = &self.channels;
            let Some(index) = queue.next_ready_consumer(|consumer| {
                consumer.no_ack
                    || channels
                        .get(&consumer.channel)
                        .is_some_and(ChannelState::has_capacity)
            }) else {
                break;
            };
            let Some(message) = queue.messages.pop_front() else {
                break;
            };

            let consumer = &queue.consumers[index];
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                // consumer outlived its channel
                let tag = consumer.tag.clone();
                queue.unsubscribe(&tag);
                queue.messages.push_front(message);
                continue;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                // receiver dropped without a cancel
                let tag = consumer.tag.clone();
                channel.consumers.remove(&tag);
                queue.unsubscribe(&tag);
                queue.messages.push_front(message);
                continue;
            }
            if !consumer.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
            queue.advance_rotation(index);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn remove_if_auto_delete(&mut self, queue_name: &str) {
        if self
            .queues
            .get(queue_name)
            .is_some_and(Queue::should_auto_delete)
        {
            self.queues.remove(queue_name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != queue_name);
            }
            debug!(queue = queue_name, "auto-delete queue removed");
        }
    }

    /// Closes a channel: its consumers go away and its unacknowledged
    /// deliveries return to the head of their queues.
    pub(crate) fn close_channel(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        let state = self
            .channels
            .remove(&channel)
            .ok_or(TransportError::ChannelClosed)?;
        if let Some(conn) = self.connections.get_mut(&state.connection) {
            conn.channels.remove(&channel);
        }

        // Highest tag first so the oldest delivery ends up at the head.
        for (_, unacked) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
            }
        }
        for (tag, queue_name) in state.consumers {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.unsubscribe(&tag);
            }
            self.remove_if_auto_delete(&queue_name);
        }

        self.operations.push(Operation::CloseChannel { channel });
        self.dispatch_all();
        Ok(())
    }

    /// Tears a connection down with the given reason. A no-op for connections
    /// that are already gone.
    pub(crate) fn close_connection(&mut self, connection: ConnectionId, reason: CloseReason) {
        let Some(state) = self.connections.remove(&connection) else {
            return;
        };
        for channel in state.channels {
            let _ = self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.exclusive_owner == Some(connection))
            .map(|q| q.name.clone())
            .collect();
        for name in exclusive {
            self.queues.remove(&name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != name);
            }
        }

        match &reason {
            CloseReason::Requested => debug!(connection, "memory broker connection closed"),
            CloseReason::Lost(why) => warn!(connection, reason = %why, "memory broker dropped connection"),
        }
        state.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn heartbeat(&mut self, connection: ConnectionId) {
        if let Some(state) = self.connections.get_mut(&connection) {
            state.last_heartbeat = Instant::now();
        }
    }

    pub(crate) fn heartbeat_overdue(&self, connection: ConnectionId, limit: Duration) -> bool {
        self.connections
            .get(&connection)
            .is_some_and(|state| state.last_heartbeat.elapsed() > limit)
    }

    pub(crate) fn take_stall(&mut self, kind: OperationKind) -> bool {
        match self.faults.stalls.iter().position(|k| *k == kind) {
            Some(index) => {
                self.faults.stalls.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Handle to an in-memory AMQP-style broker. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A [`crate::transport::Connector`] that opens connections to this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(self.clone())
    }

    /// Publish without a connection, as an external producer would.
    pub fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.state().publish(None, message)
    }

    /// The next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: u32) {
        self.state().faults.refuse_connections = count;
    }

    /// The next operation of `kind` never gets confirmed.
    pub fn stall_next(&self, kind: OperationKind) {
        self.state().faults.stalls.push(kind);
    }

    /// Drops every open connection as a network failure would.
    pub fn sever_connections(&self, reason: &str) {
        let mut state = self.state();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, CloseReason::Lost(reason.to_string()));
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Snapshot of the ready messages in `queue`, head first.
    pub fn peek_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Deliveries awaiting an ack across all channels.
    pub fn unacked_count(&self) -> usize {
        self.state().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn connection_attempts(&self) -> u64 {
        self.state().connection_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Every confirmed channel operation so far, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    pub fn count_operations(&self, kind: OperationKind) -> usize {
        self.state()
            .operations
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }
}
