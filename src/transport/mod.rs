//! The `transport` module is the seam between the job-RPC logic and a message
//! broker.
//!
//! `Connector`, `BrokerConnection` and `BrokerChannel` describe the handful of
//! AMQP operations the relay needs. `amqp` implements them on top of `lapin`
//! for a real RabbitMQ; `crate::broker` implements them in memory for tests and
//! local runs.
//!
//! Every operation resolves only once the broker has confirmed it, so callers
//! can gate the next step on the previous one and put their own deadline
//! around any step.

pub mod amqp;
pub mod message;

use std::sync::Arc;

use async_trait::async_trait;

pub use message::{
    CloseReason, ConnectOptions, ConsumeOptions, Consumer, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, MessageProperties, OutboundMessage, QueueSpec,
};

use crate::utils::error::TransportError;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// One logical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Resolves once the connection has ended, for whatever reason.
    /// Safe to call repeatedly and from several places.
    async fn closed(&self) -> CloseReason;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError>;

    /// Declares a queue and returns its name (broker-assigned when the spec
    /// name is empty).
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Caps unacknowledged deliveries on this channel. Zero means no cap.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Hands a message to the broker. No publisher confirm is awaited.
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
