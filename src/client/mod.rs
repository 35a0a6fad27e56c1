//! The `client` module is the requesting side of the job RPC.
//!
//! `JobClient` publishes a job to the shared work exchange and waits for the
//! single reply addressed to it on a private, broker-named queue.

pub mod job_client;
pub use job_client::JobClient;
