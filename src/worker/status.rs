//! Progress reporting from running jobs.
//!
//! Pipelines run on blocking worker threads, so reporting is a plain
//! synchronous send into an unbounded channel. The worker's session loop
//! drains it and publishes each update on the reply channel.

use tokio::sync::mpsc;
use tracing::trace;

/// One progress line reported by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub correlation_id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    sender: Option<mpsc::UnboundedSender<StatusUpdate>>,
}

impl StatusReporter {
    /// A reporter and the receiving end the publisher drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A reporter that drops every update.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Queues a status record for publication. Returns `false` when nobody is
    /// listening anymore; reporting never fails the job.
    pub fn report(&self, correlation_id: &str, text: impl Into<String>) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let update = StatusUpdate {
            correlation_id: correlation_id.to_string(),
            text: text.into(),
        };
        if sender.send(update).is_err() {
            trace!(correlation_id, "status update dropped, publisher gone");
            return false;
        }
        true
    }
}
