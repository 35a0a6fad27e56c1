use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::support::*;
use crate::broker::{MemoryBroker, OperationKind};
use crate::job::{JobId, JobStatus, ResultLocators, StatusRecord};
use crate::utils::error::{ClientError, PipelineError};
use crate::worker::{JobContext, Phase};

type Outcome = Result<ResultLocators, PipelineError>;

fn locators() -> ResultLocators {
    ResultLocators::new("http://img", "http://shp")
}

#[tokio::test]
async fn completed_job_reply_reaches_submitter() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;

    let client = client(&broker).await;
    let reply = client.submit(&polygon_job()).await.unwrap();

    assert_eq!(reply.status(), JobStatus::Complete);
    assert_eq!(reply.locators(), Some(locators()));
    assert_eq!(reply.job_id(), Some(&JobId::Text("57".to_string())));
    let wire = serde_json::to_value(&reply).unwrap();
    assert_eq!(wire["jobStatus"], "complete");
    assert_eq!(wire["resultImageURL"], "http://img");
    assert_eq!(wire["resultShapefileURL"], "http://shp");
    assert!(wire["error"].is_null());

    eventually("ack", || broker.count_operations(OperationKind::Ack) == 1).await;
    assert_eq!(broker.unacked_count(), 0);
    running.stop().await;
}

#[tokio::test]
async fn failed_pipeline_is_reported_as_incomplete() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Err(PipelineError::new("bounds outside coverage"))
    }));
    running.wait_for(Phase::Ready).await;

    let client = client(&broker).await;
    let reply = client.submit(&polygon_job()).await.unwrap();

    assert_eq!(reply.status(), JobStatus::Incomplete);
    assert_eq!(reply.error(), Some("bounds outside coverage"));
    let wire = serde_json::to_value(&reply).unwrap();
    assert!(wire["resultImageURL"].is_null());
    running.stop().await;
}

#[tokio::test]
async fn submitter_times_out_when_nobody_answers() {
    let broker = MemoryBroker::new();
    let client = client(&broker).await;

    let started = tokio::time::Instant::now();
    let err = client
        .submit_with_timeout(&polygon_job(), Duration::from_millis(150))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn malformed_payload_is_answered_and_acked_once() {
    let broker = MemoryBroker::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), move |_: &JobContext| -> Outcome {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    inject_job(&broker, "bad-1", Some(CALLER_QUEUE), b"not valid JSON");

    eventually("reply", || broker.queue_depth(CALLER_QUEUE) == 1).await;
    let reply = &replies(&broker, CALLER_QUEUE)[0];
    assert_eq!(reply.correlation_id(), "bad-1");
    assert_eq!(reply.status(), JobStatus::Incomplete);
    assert!(reply.error().unwrap().contains("not valid JSON"));

    eventually("ack", || broker.count_operations(OperationKind::Ack) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.count_operations(OperationKind::Ack), 1);
    assert_eq!(broker.queue_depth("pci-analysis-queue"), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    running.stop().await;
}

#[tokio::test]
async fn reply_without_reply_to_goes_to_default_reply_queue() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;

    let body = polygon_job().as_bytes().to_vec();
    inject_job(&broker, "web-42", None, &body);

    eventually("reply", || broker.queue_depth("job-reply-queue") == 1).await;
    let message = &broker.peek_messages("job-reply-queue")[0];
    assert_eq!(message.properties.correlation_id.as_deref(), Some("web-42"));
    assert!(replies(&broker, "job-reply-queue")[0].is_complete());
    running.stop().await;
}

#[tokio::test]
async fn double_encoded_payload_is_accepted() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |job: &JobContext| -> Outcome {
        assert_eq!(job.payload().geo_json()["type"], "Polygon");
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    let inner = polygon_job().as_bytes().to_vec();
    let outer = serde_json::to_vec(&String::from_utf8(inner).unwrap()).unwrap();
    inject_job(&broker, "twice", Some(CALLER_QUEUE), &outer);

    eventually("reply", || broker.queue_depth(CALLER_QUEUE) == 1).await;
    assert!(replies(&broker, CALLER_QUEUE)[0].is_complete());
    running.stop().await;
}

#[tokio::test]
async fn status_updates_reach_status_queue() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |job: &JobContext| -> Outcome {
        job.report_status("Processing");
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;

    let client = client(&broker).await;
    let reply = client.submit(&polygon_job()).await.unwrap();

    eventually("status record", || broker.queue_depth("status-queue") == 1).await;
    let message = &broker.peek_messages("status-queue")[0];
    let record: StatusRecord = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(record.status, "Processing");
    assert_eq!(record.job_id, reply.correlation_id());
    running.stop().await;
}

#[tokio::test]
async fn notifier_hears_about_each_settled_job() {
    let broker = MemoryBroker::new();
    let notifier = RecordingNotifier::default();
    let worker = worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Ok(locators())
    })
    .with_notifier(Arc::new(notifier.clone()));
    let mut running = start_worker(worker);
    running.wait_for(Phase::Ready).await;

    let client = client(&broker).await;
    client.submit(&polygon_job()).await.unwrap();

    eventually("notification", || notifier.sent.lock().unwrap().len() == 1).await;
    let sent = notifier.sent.lock().unwrap()[0].clone();
    assert_eq!(sent.id, Some(JobId::Text("57".to_string())));
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefetch_of_one_runs_jobs_one_at_a_time() {
    let broker = MemoryBroker::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), move |_: &JobContext| -> Outcome {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    let body = polygon_job().as_bytes().to_vec();
    for id in ["j-1", "j-2", "j-3"] {
        inject_job(&broker, id, Some(CALLER_QUEUE), &body);
    }

    eventually("three replies", || broker.queue_depth(CALLER_QUEUE) == 3).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let order: Vec<_> = replies(&broker, CALLER_QUEUE)
        .iter()
        .map(|reply| reply.correlation_id().to_string())
        .collect();
    assert_eq!(order, ["j-1", "j-2", "j-3"]);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_in_flight_job() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        thread::sleep(Duration::from_millis(300));
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    let body = polygon_job().as_bytes().to_vec();
    inject_job(&broker, "drain-me", Some(CALLER_QUEUE), &body);
    eventually("job in flight", || broker.unacked_count() == 1).await;

    let mut phase = running.phase.clone();
    running.stop().await;

    assert_eq!(*phase.borrow_and_update(), Phase::Disconnected);
    assert_eq!(replies(&broker, CALLER_QUEUE)[0].correlation_id(), "drain-me");
    assert_eq!(broker.count_operations(OperationKind::Ack), 1);
    assert_eq!(broker.count_operations(OperationKind::Cancel), 1);
    assert_eq!(broker.queue_depth("pci-analysis-queue"), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_abandons_jobs_that_outlast_drain() {
    let broker = MemoryBroker::new();
    let mut opts = options(Duration::ZERO);
    opts.drain_timeout = Duration::from_millis(100);
    let mut running = start_worker(worker(&broker, opts, |_: &JobContext| -> Outcome {
        thread::sleep(Duration::from_millis(800));
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    let body = polygon_job().as_bytes().to_vec();
    inject_job(&broker, "too-slow", Some(CALLER_QUEUE), &body);
    eventually("job in flight", || broker.unacked_count() == 1).await;

    running.stop().await;

    assert_eq!(broker.queue_depth(CALLER_QUEUE), 0);
    assert_eq!(broker.count_operations(OperationKind::Ack), 0);
    let requeued = broker.peek_messages("pci-analysis-queue");
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].redelivered);
}

#[tokio::test]
async fn shutdown_while_broker_refuses_connections_stops_worker() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(u32::MAX);
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Ok(locators())
    }));
    running.wait_for(Phase::Disconnected).await;

    running.stop().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn pipeline_receives_body_bytes_as_sent() {
    let body = br#"{"geoJson": {"coordinates": [-96.35082721710205, -96.33979797363281]}, "id": "57"}"#;
    let broker = MemoryBroker::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&received);
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), move |job: &JobContext| -> Outcome {
        *seen.lock().unwrap() = job.payload().as_bytes().to_vec();
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    inject_job(&broker, "exact", Some(CALLER_QUEUE), body);

    eventually("reply", || broker.queue_depth(CALLER_QUEUE) == 1).await;
    assert_eq!(received.lock().unwrap().as_slice(), body.as_slice());
    running.stop().await;
}

#[tokio::test]
async fn unconfirmed_reply_publish_does_not_wedge_worker() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;
    declare_caller_queue(&broker).await;

    broker.stall_next(OperationKind::Publish);
    let body = polygon_job().as_bytes().to_vec();
    inject_job(&broker, "lost-reply", Some(CALLER_QUEUE), &body);

    eventually("ack despite stalled reply", || {
        broker.count_operations(OperationKind::Ack) == 1
    })
    .await;
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth(CALLER_QUEUE), 0);

    inject_job(&broker, "next", Some(CALLER_QUEUE), &body);
    eventually("next reply", || broker.queue_depth(CALLER_QUEUE) == 1).await;
    assert_eq!(replies(&broker, CALLER_QUEUE)[0].correlation_id(), "next");

    running.stop().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn shutdown_moves_past_unconfirmed_steps() {
    let broker = MemoryBroker::new();
    let mut running = start_worker(worker(&broker, options(Duration::ZERO), |_: &JobContext| -> Outcome {
        Ok(locators())
    }));
    running.wait_for(Phase::Ready).await;

    broker.stall_next(OperationKind::Cancel);
    broker.stall_next(OperationKind::CloseChannel);
    let mut phase = running.phase.clone();
    running.stop().await;

    assert_eq!(*phase.borrow_and_update(), Phase::Disconnected);
    assert_eq!(broker.count_operations(OperationKind::Cancel), 0);
    assert_eq!(broker.open_connections(), 0);
}
