use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use super::queue::{Queue, QueueConsumer};
use super::{MemoryBroker, OperationKind, StoredMessage};
use crate::transport::{
    BrokerConnection, CloseReason, ConnectOptions, ConsumeOptions, Connector, Delivery,
    ExchangeSpec, MessageProperties, OutboundMessage, QueueSpec,
};
use crate::utils::error::TransportError;

async fn connect(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
    broker
        .connector()
        .connect(&ConnectOptions::for_host("memory", Duration::ZERO))
        .await
        .unwrap()
}

fn text(queue: &str, body: &str) -> OutboundMessage {
    OutboundMessage::to_queue(queue, MessageProperties::default(), body.as_bytes().to_vec())
}

async fn next(deliveries: &mut crate::transport::DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), deliveries.next())
        .await
        .expect("delivery within a second")
        .expect("stream still open")
}

#[test]
fn test_queue_round_robin_rotation() {
    let mut queue = Queue::new("q");
    for tag in ["a", "b"] {
        let (sender, _) = tokio::sync::mpsc::unbounded_channel();
        queue.subscribe(QueueConsumer {
            tag: tag.to_string(),
            channel: 1,
            no_ack: false,
            sender,
        });
    }

    let first = queue.next_ready_consumer(|_| true).unwrap();
    queue.advance_rotation(first);
    let second = queue.next_ready_consumer(|_| true).unwrap();
    assert_ne!(first, second);

    queue.advance_rotation(second);
    let skipping = queue.next_ready_consumer(|c| c.tag == "b").unwrap();
    assert_eq!(queue.consumers[skipping].tag, "b");
}

#[test]
fn test_queue_requeue_goes_to_head() {
    let mut queue = Queue::new("q");
    let message = |body: &str| StoredMessage {
        properties: MessageProperties::default(),
        body: body.as_bytes().to_vec(),
        redelivered: false,
    };
    queue.enqueue(message("second"));
    queue.requeue(message("first"));

    let head = queue.messages.front().unwrap();
    assert_eq!(head.body, b"first");
    assert!(head.redelivered);
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();

    channel.publish(text("jobs", "hello")).await.unwrap();
    channel.publish(text("nowhere", "dropped")).await.unwrap();

    assert_eq!(broker.queue_depth("jobs"), 1);
    assert_eq!(broker.peek_messages("jobs")[0].body, b"hello");
    assert!(!broker.queue_exists("nowhere"));
}

#[tokio::test]
async fn test_direct_exchange_uses_bindings() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeSpec::durable_direct("work"))
        .await
        .unwrap();
    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
    channel.bind_queue("jobs", "work", "jobs-key").await.unwrap();

    let mut message = text("", "routed");
    message.exchange = "work".to_string();
    message.routing_key = "jobs-key".to_string();
    channel.publish(message.clone()).await.unwrap();

    message.routing_key = "other".to_string();
    channel.publish(message).await.unwrap();

    assert_eq!(broker.queue_depth("jobs"), 1);
}

#[tokio::test]
async fn test_publish_to_unknown_exchange_fails() {
    let broker = MemoryBroker::new();
    let mut message = text("jobs", "x");
    message.exchange = "missing".to_string();

    let err = broker.publish(message).unwrap_err();
    assert!(matches!(err, TransportError::NotFound { kind: "exchange", .. }));
}

#[tokio::test]
async fn test_default_exchange_cannot_be_bound() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();

    let err = channel.bind_queue("jobs", "", "jobs").await.unwrap_err();
    assert!(matches!(err, TransportError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_prefetch_limits_unacked_deliveries() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
    channel.set_prefetch(1).await.unwrap();

    broker.publish(text("jobs", "one")).unwrap();
    broker.publish(text("jobs", "two")).unwrap();

    let mut consumer = channel
        .consume("jobs", ConsumeOptions::default())
        .await
        .unwrap();
    let first = next(&mut consumer.deliveries).await;
    assert_eq!(first.body, b"one");
    assert_eq!(broker.queue_depth("jobs"), 1);
    assert_eq!(broker.unacked_count(), 1);

    channel.ack(first.delivery_tag).await.unwrap();
    let second = next(&mut consumer.deliveries).await;
    assert_eq!(second.body, b"two");
    assert_eq!(broker.queue_depth("jobs"), 0);
}

#[tokio::test]
async fn test_unknown_delivery_tag_is_rejected() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();

    let err = channel.ack(42).await.unwrap_err();
    assert!(matches!(err, TransportError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_closing_channel_requeues_unacked() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
    broker.publish(text("jobs", "job")).unwrap();

    let mut consumer = channel
        .consume("jobs", ConsumeOptions::default())
        .await
        .unwrap();
    let delivery = next(&mut consumer.deliveries).await;
    assert!(!delivery.redelivered);

    channel.close().await.unwrap();
    assert!(consumer.deliveries.next().await.is_none());
    assert_eq!(broker.queue_depth("jobs"), 1);
    assert!(broker.peek_messages("jobs")[0].redelivered);

    let channel = conn.open_channel().await.unwrap();
    let mut consumer = channel
        .consume("jobs", ConsumeOptions::default())
        .await
        .unwrap();
    let again = next(&mut consumer.deliveries).await;
    assert!(again.redelivered);
    assert_eq!(again.body, b"job");
}

#[tokio::test]
async fn test_consumers_share_queue_round_robin() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
    let options = ConsumeOptions {
        no_ack: true,
        exclusive: false,
    };
    let mut a = channel.consume("jobs", options).await.unwrap();
    let mut b = channel.consume("jobs", options).await.unwrap();

    for body in ["1", "2", "3", "4"] {
        broker.publish(text("jobs", body)).unwrap();
    }

    assert_eq!(next(&mut a.deliveries).await.body, b"1");
    assert_eq!(next(&mut b.deliveries).await.body, b"2");
    assert_eq!(next(&mut a.deliveries).await.body, b"3");
    assert_eq!(next(&mut b.deliveries).await.body, b"4");
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_exclusive_queue_is_private_and_removed_with_connection() {
    let broker = MemoryBroker::new();
    let owner = connect(&broker).await;
    let other = connect(&broker).await;
    let channel = owner.open_channel().await.unwrap();
    let name = channel
        .declare_queue(&QueueSpec::exclusive_reply())
        .await
        .unwrap();
    assert!(name.starts_with("amq.gen-"));

    let foreign = other.open_channel().await.unwrap();
    let err = foreign
        .consume(&name, ConsumeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ResourceLocked(_)));

    owner.close().await.unwrap();
    assert!(!broker.queue_exists(&name));
    assert_eq!(owner.closed().await, CloseReason::Requested);
}

#[tokio::test]
async fn test_auto_delete_queue_goes_with_last_consumer() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    let name = channel
        .declare_queue(&QueueSpec::exclusive_reply())
        .await
        .unwrap();
    let consumer = channel
        .consume(&name, ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.consumer_count(&name), 1);

    channel.cancel(&consumer.tag).await.unwrap();
    assert!(!broker.queue_exists(&name));
}

#[tokio::test]
async fn test_refused_connections_are_counted() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(2);
    let connector = broker.connector();
    let options = ConnectOptions::for_host("memory", Duration::ZERO);

    assert!(connector.connect(&options).await.is_err());
    assert!(connector.connect(&options).await.is_err());
    assert!(connector.connect(&options).await.is_ok());
    assert_eq!(broker.connection_attempts(), 3);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_severed_connection_reports_loss() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();

    broker.sever_connections("network partition");

    assert_eq!(
        conn.closed().await,
        CloseReason::Lost("network partition".to_string())
    );
    assert!(!conn.is_open());
    assert!(!channel.is_open());
    assert!(matches!(
        conn.open_channel().await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_stalled_operation_never_confirms() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let channel = conn.open_channel().await.unwrap();
    broker.stall_next(OperationKind::DeclareQueue);

    let stalled = tokio::time::timeout(
        Duration::from_millis(50),
        channel.declare_queue(&QueueSpec::durable("jobs")),
    )
    .await;
    assert!(stalled.is_err());
    assert!(!broker.queue_exists("jobs"));

    channel.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
    assert_eq!(broker.count_operations(OperationKind::DeclareQueue), 1);
}

#[tokio::test]
async fn test_heartbeats_keep_idle_connection_open() {
    let broker = MemoryBroker::new();
    let conn = broker
        .connector()
        .connect(&ConnectOptions::for_host(
            "memory",
            Duration::from_millis(40),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(conn.is_open());

    conn.close().await.unwrap();
    assert_eq!(broker.open_connections(), 0);
}
