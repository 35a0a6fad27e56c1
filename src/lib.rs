//! # jobrelay
//!
//! `jobrelay` runs long analysis jobs requested over an AMQP broker and sends
//! each result back to whoever asked, correlated by id. Job execution is
//! offloaded to blocking worker threads so the broker connection keeps its
//! heartbeats flowing during multi-minute runs.
//!
//! ## Core Modules
//!
//! - `worker`: connection lifecycle with reconnect backoff, channel topology,
//!   job dispatch, reply and status publication.
//! - `client`: the submitting side; one exclusive reply queue per request.
//! - `job`: request, reply and status wire formats.
//! - `transport`: the broker seam and its `lapin` implementation.
//! - `broker`: an in-memory broker implementing the same seam.
//! - `notify`: optional STOMP-over-WebSocket push notifications.
//! - `config`: layered configuration loading.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod job;
pub mod notify;
pub mod transport;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod tests;
