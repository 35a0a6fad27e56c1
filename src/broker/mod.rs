//! In-memory AMQP-style broker.
//!
//! Implements the `transport` traits without a network so the worker and the
//! submission client can run against it in tests and local demos. It models
//! the parts of AMQP 0-9-1 the relay relies on: the default exchange, direct
//! and fanout exchanges, exclusive and auto-delete queues, per-channel
//! prefetch, manual acks with requeue on channel loss, and heartbeats.

pub mod connection;
pub mod engine;
pub mod message;
pub mod queue;

pub use connection::MemoryConnector;
pub use engine::MemoryBroker;
pub use message::{Operation, OperationKind, StoredMessage};

#[cfg(test)]
mod tests;
