//! End-to-end scenarios: a real `Worker` and `JobClient` talking through the
//! in-memory broker.

mod support;
mod worker_flow;
