use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::{JobPayload, JobReply};
use crate::transport::{
    BrokerChannel, BrokerConnection, ConnectOptions, ConsumeOptions, Connector, DeliveryStream,
    ExchangeSpec, MessageProperties, OutboundMessage, QueueSpec,
};
use crate::utils::error::ClientError;
use crate::worker::Topology;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Submits jobs and waits for their correlated replies.
///
/// Each submission declares its own exclusive reply queue, so concurrent
/// submissions never see each other's replies. The correlation id is still
/// checked on every delivery.
pub struct JobClient {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    topology: Topology,
    reply_timeout: Duration,
}

impl JobClient {
    /// Connects and makes sure the work exchange, queue and binding exist.
    pub async fn connect(
        connector: &dyn Connector,
        options: &ConnectOptions,
        topology: Topology,
    ) -> Result<Self, ClientError> {
        let connection = connector.connect(options).await?;
        let channel = connection.open_channel().await?;

        channel
            .declare_exchange(&ExchangeSpec::durable_direct(&topology.exchange))
            .await?;
        channel
            .declare_queue(&QueueSpec::durable(&topology.queue))
            .await?;
        channel
            .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
            .await?;

        Ok(Self {
            connection,
            channel,
            topology,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Submits a job and waits up to the configured reply timeout.
    pub async fn submit(&self, payload: &JobPayload) -> Result<JobReply, ClientError> {
        self.submit_with_timeout(payload, self.reply_timeout).await
    }

    pub async fn submit_with_timeout(
        &self,
        payload: &JobPayload,
        timeout: Duration,
    ) -> Result<JobReply, ClientError> {
        let body = payload.as_bytes().to_vec();

        let reply_queue = self
            .channel
            .declare_queue(&QueueSpec::exclusive_reply())
            .await?;
        let mut consumer = self
            .channel
            .consume(
                &reply_queue,
                ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                },
            )
            .await?;

        let correlation_id = Uuid::new_v4().to_string();
        let properties = MessageProperties::json()
            .with_correlation_id(&correlation_id)
            .with_reply_to(&reply_queue);
        self.channel
            .publish(OutboundMessage {
                exchange: self.topology.exchange.clone(),
                routing_key: self.topology.routing_key.clone(),
                properties,
                body,
            })
            .await?;
        info!(%correlation_id, %reply_queue, "job submitted");

        let outcome = tokio::time::timeout(
            timeout,
            wait_for_reply(&mut consumer.deliveries, &correlation_id),
        )
        .await;

        if let Err(err) = self.channel.cancel(&consumer.tag).await {
            debug!(error = %err, "reply consumer already gone");
        }

        match outcome {
            Ok(reply) => reply,
            Err(_) => {
                warn!(%correlation_id, "no reply before timeout");
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    pub async fn close(self) -> Result<(), ClientError> {
        self.connection.close().await?;
        Ok(())
    }
}

/// Waits for the delivery that answers `correlation_id`, skipping others.
async fn wait_for_reply(
    deliveries: &mut DeliveryStream,
    correlation_id: &str,
) -> Result<JobReply, ClientError> {
    while let Some(delivery) = deliveries.next().await {
        match delivery.properties.correlation_id.as_deref() {
            Some(id) if id == correlation_id => {
                return JobReply::decode(&delivery.body).map_err(ClientError::MalformedReply);
            }
            Some(other) => {
                debug!(expected = correlation_id, got = other, "skipping unrelated reply");
            }
            // Without the property, fall back to the id echoed in the body.
            None => match JobReply::decode(&delivery.body) {
                Ok(reply) if reply.correlation_id() == correlation_id => return Ok(reply),
                Ok(_) => debug!(expected = correlation_id, "skipping unrelated reply"),
                Err(err) => debug!(error = %err, "skipping undecodable reply"),
            },
        }
    }
    Err(ClientError::ReplyStreamClosed)
}
