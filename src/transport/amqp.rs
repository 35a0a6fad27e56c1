//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! The heartbeat interval is passed through the URI query so lapin negotiates
//! it during the handshake; lapin then services heartbeat frames on its own
//! I/O loop. Connection errors reported by lapin resolve `closed()` with
//! [`CloseReason::Lost`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, future};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{
    CloseReason, ConnectOptions, ConsumeOptions, Consumer, Delivery, ExchangeKind, ExchangeSpec,
    MessageProperties, OutboundMessage, QueueSpec,
};
use super::{BrokerChannel, BrokerConnection, Connector};
use crate::utils::error::TransportError;

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let uri = amqp_uri(options)?;
        let properties =
            ConnectionProperties::default().with_connection_name(options.connection_name.clone().into());

        let connection = Connection::connect_uri(uri, properties).await?;
        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);

        let on_error = Arc::clone(&closed_tx);
        connection.on_error(move |err| {
            let reason = CloseReason::Lost(err.to_string());
            on_error.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(reason);
                    true
                } else {
                    false
                }
            });
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            closed_tx,
            closed_rx,
        }))
    }
}

/// Parses the broker URL and applies the heartbeat setting to it.
pub(crate) fn amqp_uri(options: &ConnectOptions) -> Result<AMQPUri, TransportError> {
    let mut uri: AMQPUri = options
        .url
        .parse()
        .map_err(|reason: String| TransportError::InvalidUrl {
            url: options.url.clone(),
            reason,
        })?;
    let heartbeat = u16::try_from(options.heartbeat.as_secs()).unwrap_or(u16::MAX);
    uri.query.heartbeat = Some(heartbeat);
    Ok(uri)
}

pub struct AmqpConnection {
    inner: Connection,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.inner.create_channel().await?;
        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state)
                .clone()
                .unwrap_or_else(|| CloseReason::Lost("unknown".to_string())),
            Err(_) => CloseReason::Lost("connection state dropped".to_string()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(CloseReason::Requested);
                true
            } else {
                false
            }
        });
        self.inner.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        let kind = match exchange.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        let options = ExchangeDeclareOptions {
            durable: exchange.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(&exchange.name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String, TransportError> {
        let options = QueueDeclareOptions {
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .inner
            .queue_declare(&queue.name, options, FieldTable::default())
            .await?;
        Ok(declared.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, TransportError> {
        let tag = format!("jobrelay-{}", Uuid::new_v4());
        let consume_options = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, &tag, consume_options, FieldTable::default())
            .await?;

        let deliveries = consumer
            .inspect(|item| {
                if let Err(err) = item {
                    warn!(error = %err, "AMQP consumer failed");
                }
            })
            .take_while(|item| future::ready(item.is_ok()))
            .filter_map(|item| future::ready(item.ok().map(into_delivery)))
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        // The returned confirm is dropped on purpose: replies are best-effort.
        self.inner
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                into_basic_properties(&message.properties),
            )
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

fn into_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.clone().into());
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    basic
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
    };
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        properties,
        body: delivery.data,
    }
}
