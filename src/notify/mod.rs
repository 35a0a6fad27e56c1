//! Optional push notifications about settled jobs.
//!
//! Notifications are a side channel: they never influence replies or acks,
//! and a failed send is only logged by the caller.

pub mod frame;
pub mod stomp;

use async_trait::async_trait;
use serde::Serialize;

pub use stomp::StompNotifier;

use crate::job::{JobId, JobReply};
use crate::utils::error::NotifyError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: description.into(),
        }
    }

    /// Summary of a finished job for end users.
    pub fn for_reply(reply: &JobReply) -> Self {
        let description = match reply.error() {
            None => "Your image has been processed successfully!".to_string(),
            Some(error) => format!("Your image could not be processed: {error}"),
        };
        Self {
            id: reply.job_id().cloned(),
            title: "Automated Image Processing".to_string(),
            description,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}
