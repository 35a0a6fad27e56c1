//! Reply and status publication on the dedicated reply channel.
//!
//! Publishing is fire-and-forget: no publisher confirm is awaited. When the
//! reply channel is gone the caller logs the returned error and moves on.

use std::sync::Arc;

use tracing::debug;

use super::status::StatusUpdate;
use super::topology::Topology;
use crate::job::{JobReply, StatusRecord};
use crate::transport::{BrokerChannel, MessageProperties, OutboundMessage};
use crate::utils::error::ReplyError;

pub struct ReplyPublisher {
    channel: Option<Arc<dyn BrokerChannel>>,
    fallback_queue: String,
    status_queue: String,
}

impl ReplyPublisher {
    pub fn new(channel: Option<Arc<dyn BrokerChannel>>, topology: &Topology) -> Self {
        Self {
            channel,
            fallback_queue: topology.reply_queue.clone(),
            status_queue: topology.status_queue.clone(),
        }
    }

    fn open_channel(&self) -> Result<&Arc<dyn BrokerChannel>, ReplyError> {
        self.channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .ok_or(ReplyError::ChannelUnavailable)
    }

    /// Publishes `reply` to `reply_to`, or to the durable fallback reply queue
    /// when the request named none.
    pub async fn publish_reply(
        &self,
        reply_to: Option<&str>,
        reply: &JobReply,
    ) -> Result<(), ReplyError> {
        let channel = self.open_channel()?;
        let queue = reply_to
            .filter(|name| !name.is_empty())
            .unwrap_or(self.fallback_queue.as_str());
        let properties = MessageProperties::json().with_correlation_id(reply.correlation_id());
        let body = reply.encode()?;

        channel
            .publish(OutboundMessage::to_queue(queue, properties, body))
            .await?;
        debug!(
            correlation_id = reply.correlation_id(),
            queue, "reply published"
        );
        Ok(())
    }

    /// Publishes a timestamped status record to the status queue.
    pub async fn publish_status(&self, update: &StatusUpdate) -> Result<(), ReplyError> {
        let channel = self.open_channel()?;
        let record = StatusRecord::now(&update.correlation_id, &update.text);
        let properties = MessageProperties::json().with_correlation_id(&update.correlation_id);
        let body = serde_json::to_vec(&record)?;

        channel
            .publish(OutboundMessage::to_queue(&self.status_queue, properties, body))
            .await?;
        Ok(())
    }
}
