//! STOMP-over-WebSocket notifier.
//!
//! One short-lived session per notification: CONNECT, wait for CONNECTED,
//! SEND the JSON body to the configured destination, DISCONNECT. The whole
//! exchange runs under a single deadline.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use super::frame::StompFrame;
use super::{Notification, Notifier};
use crate::utils::error::NotifyError;

pub const DEFAULT_DESTINATION: &str = "/app/application";

#[derive(Debug, Clone)]
pub struct StompNotifier {
    url: String,
    destination: String,
    timeout: Duration,
}

impl StompNotifier {
    pub fn new(url: impl Into<String>, destination: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            timeout,
        }
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (mut ws, _) = connect_async(self.url.as_str()).await?;

        let connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("heart-beat", "0,0");
        ws.send(WsMessage::Text(connect.encode().into())).await?;

        loop {
            let Some(message) = ws.next().await else {
                return Err(NotifyError::Rejected(
                    "connection closed before CONNECTED".to_string(),
                ));
            };
            let text = match message? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => {
                    return Err(NotifyError::Rejected(
                        "connection closed before CONNECTED".to_string(),
                    ));
                }
                _ => continue,
            };
            let Some(frame) = StompFrame::parse(text.as_str()) else {
                continue;
            };
            match frame.command.as_str() {
                "CONNECTED" => break,
                "ERROR" => {
                    let reason = frame
                        .header_value("message")
                        .map(str::to_string)
                        .unwrap_or(frame.body);
                    return Err(NotifyError::Rejected(reason));
                }
                other => debug!(command = other, "ignoring STOMP frame before CONNECTED"),
            }
        }

        let send = StompFrame::new("SEND")
            .header("destination", self.destination.as_str())
            .header("content-type", "application/json")
            .body(serde_json::to_string(notification)?);
        ws.send(WsMessage::Text(send.encode().into())).await?;
        ws.send(WsMessage::Text(StompFrame::new("DISCONNECT").encode().into()))
            .await?;
        ws.close(None).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for StompNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tokio::time::timeout(self.timeout, self.deliver(notification))
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))??;
        debug!(destination = %self.destination, "notification sent");
        Ok(())
    }
}
