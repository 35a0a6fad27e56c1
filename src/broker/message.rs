//! Message and operation records kept by the in-memory broker.
//!
//! `StoredMessage` is what sits in a queue between publish and delivery.
//! `Operation` is the broker's log of confirmed channel operations, in the
//! order they were applied, so tests can assert on handshake order and ack
//! counts without instrumenting the code under test.

use crate::transport::MessageProperties;

pub type ConnectionId = u64;
pub type ChannelId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Set once the message has been delivered and put back unacknowledged.
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    SetPrefetch,
    Consume,
    Cancel,
    Publish,
    Ack,
    CloseChannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    OpenChannel {
        channel: ChannelId,
    },
    DeclareExchange {
        channel: ChannelId,
        name: String,
    },
    DeclareQueue {
        channel: ChannelId,
        name: String,
    },
    BindQueue {
        channel: ChannelId,
        queue: String,
        exchange: String,
        routing_key: String,
    },
    SetPrefetch {
        channel: ChannelId,
        count: u16,
    },
    Consume {
        channel: ChannelId,
        queue: String,
    },
    Cancel {
        channel: ChannelId,
        tag: String,
    },
    Publish {
        channel: Option<ChannelId>,
        exchange: String,
        routing_key: String,
    },
    Ack {
        channel: ChannelId,
        delivery_tag: u64,
    },
    CloseChannel {
        channel: ChannelId,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::OpenChannel { .. } => OperationKind::OpenChannel,
            Operation::DeclareExchange { .. } => OperationKind::DeclareExchange,
            Operation::DeclareQueue { .. } => OperationKind::DeclareQueue,
            Operation::BindQueue { .. } => OperationKind::BindQueue,
            Operation::SetPrefetch { .. } => OperationKind::SetPrefetch,
            Operation::Consume { .. } => OperationKind::Consume,
            Operation::Cancel { .. } => OperationKind::Cancel,
            Operation::Publish { .. } => OperationKind::Publish,
            Operation::Ack { .. } => OperationKind::Ack,
            Operation::CloseChannel { .. } => OperationKind::CloseChannel,
        }
    }

    /// Channel the operation ran on; `None` for messages injected directly
    /// into the broker.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Operation::Publish { channel, .. } => *channel,
            Operation::OpenChannel { channel }
            | Operation::DeclareExchange { channel, .. }
            | Operation::DeclareQueue { channel, .. }
            | Operation::BindQueue { channel, .. }
            | Operation::SetPrefetch { channel, .. }
            | Operation::Consume { channel, .. }
            | Operation::Cancel { channel, .. }
            | Operation::Ack { channel, .. }
            | Operation::CloseChannel { channel } => Some(*channel),
        }
    }
}
