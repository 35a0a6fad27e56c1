//! Transport implementation over the in-memory broker.
//!
//! Every operation checks for an injected stall first. A stalled operation
//! never resolves, which is how a broker that stops confirming looks from the
//! client side; callers are expected to put a deadline around each step.
//!
//! When a heartbeat interval is configured, each connection runs two tasks:
//! a client-side ticker that refreshes the heartbeat every half interval, and
//! a broker-side watchdog that drops the connection once no heartbeat has
//! been seen for two intervals. Both stop when the connection closes.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::sync::watch;
use tracing::debug;

use super::engine::{ClosedSender, MemoryBroker};
use super::message::{ChannelId, ConnectionId, OperationKind};
use crate::transport::{
    BrokerChannel, BrokerConnection, CloseReason, ConnectOptions, ConsumeOptions, Consumer,
    Connector, ExchangeSpec, OutboundMessage, QueueSpec,
};
use crate::utils::error::TransportError;

/// Opens connections to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let (id, closed) = self.broker.state().open_connection()?;
        let connection = MemoryConnection {
            id,
            broker: self.broker.clone(),
            closed_rx: closed.subscribe(),
            closed,
        };
        if !options.heartbeat.is_zero() {
            connection.spawn_heartbeat(options.heartbeat);
        }
        debug!(
            connection = id,
            name = %options.connection_name,
            "connected to memory broker"
        );
        Ok(Arc::new(connection))
    }
}

/// Waits forever when an injected stall matches `kind`.
async fn confirm(broker: &MemoryBroker, kind: OperationKind) {
    let stalled = broker.state().take_stall(kind);
    if stalled {
        debug!(?kind, "memory broker withholding confirmation");
        future::pending::<()>().await;
    }
}

pub struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
    closed: ClosedSender,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

impl MemoryConnection {
    fn spawn_heartbeat(&self, interval: Duration) {
        let tick = interval / 2;
        let limit = interval * 2;

        let broker = self.broker.clone();
        let id = self.id;
        let mut closed = self.closed_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => broker.state().heartbeat(id),
                    _ = closed.wait_for(Option::is_some) => break,
                }
            }
        });

        let broker = self.broker.clone();
        let id = self.id;
        let mut closed = self.closed_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut state = broker.state();
                        if state.heartbeat_overdue(id, limit) {
                            state.close_connection(id, CloseReason::Lost("missed heartbeats".to_string()));
                            break;
                        }
                    }
                    _ = closed.wait_for(Option::is_some) => break,
                }
            }
        });
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        confirm(&self.broker, OperationKind::OpenChannel).await;
        let id = self.broker.state().open_channel(self.id)?;
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state)
                .clone()
                .unwrap_or_else(|| CloseReason::Lost("unknown".to_string())),
            Err(_) => CloseReason::Lost("broker dropped".to_string()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.connection_open(self.id) {
            return Err(TransportError::ConnectionClosed);
        }
        state.close_connection(self.id, CloseReason::Requested);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.closed.borrow().is_none()
    }
}

pub struct MemoryChannel {
    id: ChannelId,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::DeclareExchange).await;
        self.broker.state().declare_exchange(self.id, exchange)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String, TransportError> {
        confirm(&self.broker, OperationKind::DeclareQueue).await;
        self.broker.state().declare_queue(self.id, queue)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::BindQueue).await;
        self.broker
            .state()
            .bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::SetPrefetch).await;
        self.broker.state().set_prefetch(self.id, count)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, TransportError> {
        confirm(&self.broker, OperationKind::Consume).await;
        let (tag, receiver) = self.broker.state().consume(self.id, queue, options)?;
        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed();
        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::Cancel).await;
        self.broker.state().cancel(self.id, consumer_tag)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::Publish).await;
        self.broker.state().publish(Some(self.id), message)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::Ack).await;
        self.broker.state().ack(self.id, delivery_tag)
    }

    async fn close(&self) -> Result<(), TransportError> {
        confirm(&self.broker, OperationKind::CloseChannel).await;
        self.broker.state().close_channel(self.id)
    }

    fn is_open(&self) -> bool {
        self.broker.state().channel_open(self.id)
    }
}
