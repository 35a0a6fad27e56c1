use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::MemoryBroker;
use crate::client::JobClient;
use crate::job::{JobPayload, JobReply};
use crate::notify::{Notification, Notifier};
use crate::transport::{ConnectOptions, Connector, MessageProperties, OutboundMessage, QueueSpec};
use crate::utils::error::NotifyError;
use crate::worker::{Phase, PipelineExecutor, ShutdownHandle, Topology, Worker, WorkerOptions};

pub const CALLER_QUEUE: &str = "caller-queue";

pub fn options(heartbeat: Duration) -> WorkerOptions {
    let mut options = WorkerOptions::new(ConnectOptions::for_host("memory", heartbeat));
    options.reconnect_step = Duration::from_millis(20);
    options.reconnect_max = Duration::from_millis(100);
    options.step_timeout = Duration::from_millis(200);
    options.drain_timeout = Duration::from_secs(2);
    options
}

pub struct RunningWorker {
    pub shutdown: ShutdownHandle,
    pub phase: watch::Receiver<Phase>,
    pub task: JoinHandle<()>,
}

impl RunningWorker {
    pub async fn wait_for(&mut self, wanted: Phase) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.phase.wait_for(|phase| *phase == wanted),
        )
        .await
        .expect("worker reached phase in time")
        .expect("worker still running");
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("worker stopped in time")
            .expect("worker task did not panic");
    }
}

pub fn start_worker(worker: Worker) -> RunningWorker {
    let shutdown = worker.shutdown_handle();
    let phase = worker.phase();
    let task = tokio::spawn(worker.run());
    RunningWorker {
        shutdown,
        phase,
        task,
    }
}

pub fn worker<E: PipelineExecutor>(broker: &MemoryBroker, options: WorkerOptions, executor: E) -> Worker {
    Worker::new(Arc::new(broker.connector()), options, Arc::new(executor))
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn polygon_job() -> JobPayload {
    JobPayload::from_value(json!({
        "geoJson": {
            "type": "Polygon",
            "coordinates": [[[-8.61, 41.14], [-8.60, 41.14], [-8.60, 41.15], [-8.61, 41.14]]]
        },
        "id": "57"
    }))
    .unwrap()
}

pub async fn client(broker: &MemoryBroker) -> JobClient {
    JobClient::connect(
        &broker.connector(),
        &ConnectOptions::for_host("memory", Duration::ZERO),
        Topology::default(),
    )
    .await
    .unwrap()
}

/// Declares a durable queue that outlives the connection declaring it.
pub async fn declare_caller_queue(broker: &MemoryBroker) {
    let conn = broker
        .connector()
        .connect(&ConnectOptions::for_host("memory", Duration::ZERO))
        .await
        .unwrap();
    let channel = conn.open_channel().await.unwrap();
    channel
        .declare_queue(&QueueSpec::durable(CALLER_QUEUE))
        .await
        .unwrap();
    conn.close().await.unwrap();
}

/// Publishes a raw job body the way an external producer would.
pub fn inject_job(broker: &MemoryBroker, correlation_id: &str, reply_to: Option<&str>, body: &[u8]) {
    let mut properties = MessageProperties::json().with_correlation_id(correlation_id);
    properties.reply_to = reply_to.map(str::to_string);
    let topology = Topology::default();
    broker
        .publish(OutboundMessage {
            exchange: topology.exchange,
            routing_key: topology.routing_key,
            properties,
            body: body.to_vec(),
        })
        .unwrap();
}

pub fn replies(broker: &MemoryBroker, queue: &str) -> Vec<JobReply> {
    broker
        .peek_messages(queue)
        .iter()
        .map(|message| JobReply::decode(&message.body).unwrap())
        .collect()
}

#[derive(Default, Clone)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<Notification>>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
