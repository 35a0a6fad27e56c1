//! Worker controller
//!
//! Owns the single broker connection of the process and drives it through
//! the phases in [`Phase`]:
//! - connects, runs the topology handshake and enters `Ready`
//! - runs the session loop, the only writer on both channels: it starts a
//!   task per delivery, publishes each finished reply, acks the delivery and
//!   forwards status updates
//! - on an unexpected close, abandons in-flight jobs (the broker redelivers
//!   them), backs off and reconnects
//! - on shutdown, cancels the consumer, drains in-flight jobs for a bounded
//!   time and closes channels and connection one bounded step at a time

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use super::dispatcher::{Completed, JobDispatcher};
use super::pipeline::PipelineExecutor;
use super::reply::ReplyPublisher;
use super::shutdown::{self, ShutdownHandle};
use super::state::{ConnectionState, Phase, ReconnectPolicy};
use super::status::{StatusReporter, StatusUpdate};
use super::topology::{self, Established, Topology};
use crate::notify::{Notification, Notifier};
use crate::transport::{BrokerChannel, BrokerConnection, CloseReason, ConnectOptions, Connector};
use crate::utils::error::TransportError;

/// Runtime options of a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub connect: ConnectOptions,
    pub topology: Topology,
    pub reconnect_step: Duration,
    pub reconnect_max: Duration,
    /// Deadline for each handshake and shutdown step.
    pub step_timeout: Duration,
    /// How long a graceful shutdown waits for in-flight jobs.
    pub drain_timeout: Duration,
}

impl WorkerOptions {
    pub fn new(connect: ConnectOptions) -> Self {
        Self {
            connect,
            topology: Topology::default(),
            reconnect_step: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            step_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(CloseReason),
}

pub struct Worker {
    connector: Arc<dyn Connector>,
    options: WorkerOptions,
    dispatcher: JobDispatcher,
    status_rx: mpsc::UnboundedReceiver<StatusUpdate>,
    notifier: Option<Arc<dyn Notifier>>,
    state: ConnectionState,
    shutdown: ShutdownHandle,
}

impl Worker {
    pub fn new(
        connector: Arc<dyn Connector>,
        options: WorkerOptions,
        executor: Arc<dyn PipelineExecutor>,
    ) -> Self {
        let (status, status_rx) = StatusReporter::channel();
        let backoff = ReconnectPolicy::new(options.reconnect_step, options.reconnect_max);
        Self {
            connector,
            dispatcher: JobDispatcher::new(executor, status)
                .with_concurrency_limit(options.topology.prefetch),
            status_rx,
            notifier: None,
            state: ConnectionState::new(backoff),
            shutdown: ShutdownHandle::new(),
            options,
        }
    }

    /// Sends a push notification for every settled job.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Watches the connection phase.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.state.subscribe()
    }

    /// Runs until shutdown is requested. Transport failures are never fatal:
    /// they lead to a reconnect.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.receiver();

        while !self.shutdown.is_triggered() {
            self.state.set_phase(Phase::Connecting);
            info!(url = %self.options.connect.url, "connecting to broker");

            let attempt = tokio::select! {
                result = self.connector.connect(&self.options.connect) => result,
                _ = shutdown::requested(&mut shutdown) => break,
            };
            let connection = match attempt {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(error = %err, "broker connection failed");
                    self.state.set_phase(Phase::Disconnected);
                    if !self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.state.set_phase(Phase::ChannelsOpening);
            let established = tokio::select! {
                result = topology::establish(
                    connection.as_ref(),
                    &self.options.topology,
                    self.options.step_timeout,
                ) => result,
                _ = shutdown::requested(&mut shutdown) => {
                    self.close_step("close connection", connection.close()).await;
                    break;
                }
            };
            let established = match established {
                Ok(established) => established,
                Err(err) => {
                    warn!(error = %err, "channel setup failed");
                    self.close_step("close connection", connection.close()).await;
                    self.state.set_phase(Phase::Disconnected);
                    if !self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.state.backoff.reset();
            self.state.set_phase(Phase::Ready);
            info!(
                queue = %self.options.topology.queue,
                prefetch = self.options.topology.prefetch,
                "worker ready"
            );

            let end = self
                .session(connection.as_ref(), established, &mut shutdown)
                .await;
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    warn!(%reason, "broker connection lost");
                    self.state.set_phase(Phase::Reconnecting);
                    if !self.back_off(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.state.set_phase(Phase::Disconnected);
        info!("worker stopped");
    }

    /// Waits out the next reconnect delay. Returns `false` when shutdown was
    /// requested meanwhile.
    async fn back_off(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.state.backoff.next_delay();
        info!(delay_secs = delay.as_secs_f64(), "reconnecting after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown::requested(shutdown) => false,
        }
    }

    async fn session(
        &mut self,
        connection: &dyn BrokerConnection,
        established: Established,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let Established {
            main,
            reply,
            mut consumer,
        } = established;
        let publisher = ReplyPublisher::new(Some(Arc::clone(&reply)), &self.options.topology);
        let mut jobs: JoinSet<Completed> = JoinSet::new();
        let closed = connection.closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = shutdown::requested(shutdown) => {
                    self.close_gracefully(connection, &main, &reply, &consumer.tag, &mut jobs, &publisher)
                        .await;
                    return SessionEnd::Shutdown;
                }
                reason = &mut closed => {
                    jobs.abort_all();
                    return SessionEnd::Lost(reason);
                }
                delivery = consumer.deliveries.next() => match delivery {
                    Some(delivery) => {
                        let dispatcher = self.dispatcher.clone();
                        jobs.spawn(async move { dispatcher.handle(delivery).await });
                    }
                    None => {
                        jobs.abort_all();
                        if connection.is_open() {
                            self.close_step("close connection", connection.close()).await;
                        }
                        return SessionEnd::Lost(CloseReason::Lost("consumer stream ended".to_string()));
                    }
                },
                Some(result) = jobs.join_next(), if !jobs.is_empty() => {
                    self.settle(result, &main, &publisher).await;
                }
                Some(update) = self.status_rx.recv() => {
                    self.forward_status(&update, &publisher).await;
                }
            }
        }
    }

    /// Publishes the reply of a finished job, then acks its delivery.
    async fn settle(
        &self,
        result: Result<Completed, JoinError>,
        main: &Arc<dyn BrokerChannel>,
        publisher: &ReplyPublisher,
    ) {
        let completed = match result {
            Ok(completed) => completed,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                error!(error = %err, "job task panicked; delivery stays unacked until reconnect");
                return;
            }
        };
        let correlation_id = completed.reply.correlation_id();

        let publish = publisher.publish_reply(completed.reply_to.as_deref(), &completed.reply);
        match tokio::time::timeout(self.options.step_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%correlation_id, error = %err, "reply dropped"),
            Err(_) => warn!(%correlation_id, "reply publish not confirmed in time, acking anyway"),
        }

        match tokio::time::timeout(self.options.step_timeout, main.ack(completed.delivery_tag)).await {
            Ok(Ok(())) => info!(
                %correlation_id,
                delivery_tag = completed.delivery_tag,
                status = ?completed.reply.status(),
                "job settled"
            ),
            Ok(Err(err)) => warn!(%correlation_id, error = %err, "ack failed"),
            Err(_) => warn!(%correlation_id, "ack was not confirmed in time"),
        }

        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            let notification = Notification::for_reply(&completed.reply);
            tokio::spawn(async move {
                if let Err(err) = notifier.send(&notification).await {
                    warn!(error = %err, "push notification failed");
                }
            });
        }
    }

    async fn close_gracefully(
        &mut self,
        connection: &dyn BrokerConnection,
        main: &Arc<dyn BrokerChannel>,
        reply: &Arc<dyn BrokerChannel>,
        consumer_tag: &str,
        jobs: &mut JoinSet<Completed>,
        publisher: &ReplyPublisher,
    ) {
        self.state.set_phase(Phase::Closing);
        info!(in_flight = jobs.len(), "shutting down worker");

        self.close_step("cancel consumer", main.cancel(consumer_tag))
            .await;

        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;
        while !jobs.is_empty() {
            match tokio::time::timeout_at(deadline, jobs.join_next()).await {
                Ok(Some(result)) => self.settle(result, main, publisher).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = jobs.len(),
                        "drain timed out, unfinished jobs will be redelivered"
                    );
                    jobs.abort_all();
                    break;
                }
            }
        }
        while let Ok(update) = self.status_rx.try_recv() {
            self.forward_status(&update, publisher).await;
        }

        self.close_step("close main channel", main.close()).await;
        self.close_step("close reply channel", reply.close()).await;
        self.close_step("close connection", connection.close()).await;
    }

    async fn forward_status(&self, update: &StatusUpdate, publisher: &ReplyPublisher) {
        let publish = publisher.publish_status(update);
        match tokio::time::timeout(self.options.step_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(correlation_id = %update.correlation_id, error = %err, "status update dropped")
            }
            Err(_) => warn!(
                correlation_id = %update.correlation_id,
                "status publish not confirmed in time"
            ),
        }
    }

    /// Runs one teardown step under the step deadline; failures are logged
    /// and teardown moves on.
    async fn close_step<F>(&self, step: &str, operation: F)
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        match tokio::time::timeout(self.options.step_timeout, operation).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(step, error = %err, "shutdown step failed"),
            Err(_) => warn!(step, "shutdown step not confirmed in time, continuing"),
        }
    }
}
