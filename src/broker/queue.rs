//! Queue management
//!
//! A `Queue` holds ready messages in FIFO order plus the consumers attached to
//! it. Consumers are served round-robin; the broker engine decides whether a
//! consumer's channel has prefetch capacity left.
//!
//! Concurrency note: callers must synchronize access to `Queue` (the broker
//! lock) when modifying it.

use std::collections::VecDeque;

use tokio::sync::mpsc::UnboundedSender;

use super::message::{ChannelId, ConnectionId, StoredMessage};
use crate::transport::Delivery;

#[derive(Debug)]
pub struct QueueConsumer {
    pub tag: String,
    pub channel: ChannelId,
    pub no_ack: bool,
    pub sender: UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Connection that declared an exclusive queue.
    pub exclusive_owner: Option<ConnectionId>,
    pub messages: VecDeque<StoredMessage>,
    pub consumers: Vec<QueueConsumer>,
    had_consumers: bool,
    next_consumer: usize,
}

impl Queue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Attach a consumer. It joins the end of the round-robin rotation.
    pub fn subscribe(&mut self, consumer: QueueConsumer) {
        self.had_consumers = true;
        self.consumers.push(consumer);
    }

    /// Detach a consumer by tag. Dropping it ends its delivery stream.
    pub fn unsubscribe(&mut self, tag: &str) -> Option<QueueConsumer> {
        let index = self.consumers.iter().position(|c| c.tag == tag)?;
        if index < self.next_consumer {
            self.next_consumer -= 1;
        }
        Some(self.consumers.remove(index))
    }

    pub fn enqueue(&mut self, message: StoredMessage) {
        self.messages.push_back(message);
    }

    /// Put an unacknowledged message back at the head of the queue.
    pub fn requeue(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.messages.push_front(message);
    }

    /// An auto-delete queue goes away once it has had a consumer and lost
    /// the last one.
    pub fn should_auto_delete(&self) -> bool {
        self.auto_delete && self.had_consumers && self.consumers.is_empty()
    }

    /// Index of the next consumer, in rotation order, that `accepts`.
    pub fn next_ready_consumer(&self, accepts: impl Fn(&QueueConsumer) -> bool) -> Option<usize> {
        let count = self.consumers.len();
        (0..count)
            .map(|offset| (self.next_consumer + offset) % count)
            .find(|&index| accepts(&self.consumers[index]))
    }

    pub fn advance_rotation(&mut self, served: usize) {
        self.next_consumer = (served + 1) % self.consumers.len().max(1);
    }
}
