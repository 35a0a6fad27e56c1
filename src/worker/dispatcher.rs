//! Job dispatching
//!
//! Turns one inbound delivery into exactly one reply. Decoding happens on the
//! calling task; the pipeline runs on tokio's blocking pool and is awaited
//! from there, so the runtime threads that service heartbeats stay free for
//! the whole run.
//!
//! Every failure ends up as an `incomplete` reply. A malformed payload is
//! answered without running the pipeline so that it is acknowledged once and
//! never loops back through the queue.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::pipeline::{JobContext, PipelineExecutor};
use super::status::StatusReporter;
use crate::job::{JobPayload, JobReply};
use crate::transport::Delivery;

/// Outcome of one dispatched delivery, handed back to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub delivery_tag: u64,
    pub reply_to: Option<String>,
    pub reply: JobReply,
}

#[derive(Clone)]
pub struct JobDispatcher {
    executor: Arc<dyn PipelineExecutor>,
    status: StatusReporter,
    slots: Option<Arc<Semaphore>>,
}

impl JobDispatcher {
    pub fn new(executor: Arc<dyn PipelineExecutor>, status: StatusReporter) -> Self {
        Self {
            executor,
            status,
            slots: None,
        }
    }

    /// Caps concurrent pipeline runs at `limit`; zero leaves them uncapped.
    ///
    /// Aborting a dispatch cannot stop a pipeline already on the blocking
    /// pool, so a run orphaned by a lost connection keeps its slot until it
    /// returns and a redelivery of the same job waits for it.
    pub fn with_concurrency_limit(mut self, limit: u16) -> Self {
        self.slots = (limit > 0).then(|| Arc::new(Semaphore::new(usize::from(limit))));
        self
    }

    pub async fn handle(&self, delivery: Delivery) -> Completed {
        let correlation_id = match &delivery.properties.correlation_id {
            Some(id) => id.clone(),
            None => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    "delivery carries no correlation id"
                );
                String::new()
            }
        };
        if delivery.redelivered {
            info!(%correlation_id, "processing redelivered job");
        }

        let reply = match JobPayload::decode(&delivery.body) {
            Ok(payload) => self.run(correlation_id, payload).await,
            Err(err) => {
                warn!(%correlation_id, error = %err, "rejecting malformed job payload");
                JobReply::incomplete(correlation_id, None, format!("invalid job payload: {err}"))
            }
        };

        Completed {
            delivery_tag: delivery.delivery_tag,
            reply_to: delivery.properties.reply_to,
            reply,
        }
    }

    async fn run(&self, correlation_id: String, payload: JobPayload) -> JobReply {
        let job_id = payload.job_id();
        info!(%correlation_id, job_id = ?job_id, "starting pipeline");

        let permit = match &self.slots {
            Some(slots) => {
                if slots.available_permits() == 0 {
                    debug!(%correlation_id, "waiting for a pipeline slot");
                }
                Arc::clone(slots).acquire_owned().await.ok()
            }
            None => None,
        };

        let context = JobContext::new(correlation_id.clone(), payload, self.status.clone());
        let executor = Arc::clone(&self.executor);
        let outcome = tokio::task::spawn_blocking(move || {
            let _slot = permit;
            executor.execute(&context)
        })
        .await;

        match outcome {
            Ok(Ok(locators)) => {
                info!(%correlation_id, "pipeline completed");
                JobReply::complete(correlation_id, job_id, locators)
            }
            Ok(Err(err)) => {
                warn!(%correlation_id, error = %err, "pipeline failed");
                JobReply::incomplete(correlation_id, job_id, err.message())
            }
            Err(join_err) => {
                warn!(%correlation_id, error = %join_err, "pipeline task aborted");
                JobReply::incomplete(
                    correlation_id,
                    job_id,
                    format!("pipeline task failed: {join_err}"),
                )
            }
        }
    }
}
