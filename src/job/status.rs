use serde::{Deserialize, Serialize};

/// Keep-alive/progress record published to the status queue.
///
/// Not correlated with any reply; observers only use it to see that a long
/// job is still moving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: String,
    pub job_id: String,
    /// Fractional UNIX seconds at send time.
    pub timestamp: f64,
}

impl StatusRecord {
    pub fn now(job_id: impl Into<String>, status: impl Into<String>) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        Self {
            status: status.into(),
            job_id: job_id.into(),
            timestamp: millis as f64 / 1000.0,
        }
    }
}
