//! Types that cross the transport seam.
//!
//! They mirror the AMQP 0-9-1 vocabulary closely enough that the lapin
//! implementation is a field-by-field conversion, while staying free of any
//! client-library types so the loopback broker can produce them too.

use std::fmt;
use std::time::Duration;

use futures_util::stream::BoxStream;

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    /// Heartbeat interval negotiated with the broker. Zero disables heartbeats.
    pub heartbeat: Duration,
    pub connection_name: String,
}

impl ConnectOptions {
    /// Builds options from a bare broker host or a full AMQP URL.
    pub fn for_host(host: &str, heartbeat: Duration) -> Self {
        let url = if host.starts_with("amqp://") || host.starts_with("amqps://") {
            host.to_string()
        } else {
            format!("amqp://{host}")
        };
        Self {
            url,
            heartbeat,
            connection_name: "jobrelay".to_string(),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Requested,
    /// The broker or the network dropped the connection.
    Lost(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed on request"),
            CloseReason::Lost(reason) => write!(f, "connection lost: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable_direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty asks the broker to assign a name.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Self::default()
        }
    }

    /// A private, broker-named queue that disappears with its connection or
    /// its last consumer.
    pub fn exclusive_reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent.
    pub no_ack: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Empty means the default exchange, which routes by queue name.
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// A message for the default exchange, addressed straight to `queue`.
    pub fn to_queue(queue: impl Into<String>, properties: MessageProperties, body: Vec<u8>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: queue.into(),
            properties,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Stream of deliveries for one consumer. Ends when the consumer is cancelled
/// or its channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

pub struct Consumer {
    pub tag: String,
    pub deliveries: DeliveryStream,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}
