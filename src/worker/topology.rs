//! Channel setup handshake.
//!
//! On a fresh connection the main channel runs, strictly in order:
//! declare exchange, declare work queue, bind, declare status queue, declare
//! fallback reply queue, set prefetch, start consuming. A second channel used
//! only for publishing replies opens concurrently and needs no declarations.
//!
//! Each step awaits the broker's confirmation under its own deadline. A step
//! that fails or never confirms leaves the topology unusable and the caller
//! treats the whole connection as failed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::transport::{
    BrokerChannel, BrokerConnection, ConsumeOptions, Consumer, ExchangeSpec, QueueSpec,
};
use crate::utils::error::{TopologyError, TransportError};

/// Names and limits shared by every component during one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    /// Durable queue for replies to requests that carry no `reply_to`.
    pub reply_queue: String,
    pub status_queue: String,
    pub prefetch: u16,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "pci-analysis".to_string(),
            queue: "pci-analysis-queue".to_string(),
            routing_key: "pci-analysis-queue".to_string(),
            reply_queue: "job-reply-queue".to_string(),
            status_queue: "status-queue".to_string(),
            prefetch: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    OpenMainChannel,
    DeclareExchange,
    DeclareWorkQueue,
    BindWorkQueue,
    DeclareStatusQueue,
    DeclareReplyQueue,
    SetPrefetch,
    StartConsuming,
    OpenReplyChannel,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::OpenMainChannel => "open main channel",
            SetupStep::DeclareExchange => "declare exchange",
            SetupStep::DeclareWorkQueue => "declare work queue",
            SetupStep::BindWorkQueue => "bind work queue",
            SetupStep::DeclareStatusQueue => "declare status queue",
            SetupStep::DeclareReplyQueue => "declare reply queue",
            SetupStep::SetPrefetch => "set prefetch",
            SetupStep::StartConsuming => "start consuming",
            SetupStep::OpenReplyChannel => "open reply channel",
        };
        f.write_str(name)
    }
}

/// Channels and consumer of a connection whose topology is in place.
pub struct Established {
    pub main: Arc<dyn BrokerChannel>,
    pub reply: Arc<dyn BrokerChannel>,
    pub consumer: Consumer,
}

async fn run_step<T, F>(step: SetupStep, timeout: Duration, operation: F) -> Result<T, TopologyError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(value)) => {
            debug!(%step, "setup step confirmed");
            Ok(value)
        }
        Ok(Err(source)) => Err(TopologyError::Step { step, source }),
        Err(_) => Err(TopologyError::Timeout { step, timeout }),
    }
}

/// Runs the declare/bind/QoS/consume chain on the main channel.
async fn open_main(
    connection: &dyn BrokerConnection,
    topology: &Topology,
    timeout: Duration,
) -> Result<(Arc<dyn BrokerChannel>, Consumer), TopologyError> {
    let channel = run_step(SetupStep::OpenMainChannel, timeout, connection.open_channel()).await?;

    run_step(
        SetupStep::DeclareExchange,
        timeout,
        channel.declare_exchange(&ExchangeSpec::durable_direct(&topology.exchange)),
    )
    .await?;
    run_step(
        SetupStep::DeclareWorkQueue,
        timeout,
        channel.declare_queue(&QueueSpec::durable(&topology.queue)),
    )
    .await?;
    run_step(
        SetupStep::BindWorkQueue,
        timeout,
        channel.bind_queue(&topology.queue, &topology.exchange, &topology.routing_key),
    )
    .await?;
    run_step(
        SetupStep::DeclareStatusQueue,
        timeout,
        channel.declare_queue(&QueueSpec::durable(&topology.status_queue)),
    )
    .await?;
    run_step(
        SetupStep::DeclareReplyQueue,
        timeout,
        channel.declare_queue(&QueueSpec::durable(&topology.reply_queue)),
    )
    .await?;
    run_step(
        SetupStep::SetPrefetch,
        timeout,
        channel.set_prefetch(topology.prefetch),
    )
    .await?;
    let consumer = run_step(
        SetupStep::StartConsuming,
        timeout,
        channel.consume(&topology.queue, ConsumeOptions::default()),
    )
    .await?;

    Ok((channel, consumer))
}

/// Sets up both channels of a freshly opened connection.
pub async fn establish(
    connection: &dyn BrokerConnection,
    topology: &Topology,
    step_timeout: Duration,
) -> Result<Established, TopologyError> {
    let reply = run_step(
        SetupStep::OpenReplyChannel,
        step_timeout,
        connection.open_channel(),
    );
    let ((main, consumer), reply) =
        tokio::try_join!(open_main(connection, topology, step_timeout), reply)?;

    Ok(Established {
        main,
        reply,
        consumer,
    })
}
