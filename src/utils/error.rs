//! The `error` module defines the error types used across `jobrelay`.
//!
//! Each concern gets its own enum so callers can tell a transport failure
//! (recovered by reconnecting) from a decode or pipeline failure (recovered by
//! replying `incomplete`) without string matching.

use std::time::Duration;

use thiserror::Error;

use crate::worker::topology::SetupStep;

/// Failures raised by a broker connection or channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("no {kind} named '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("resource locked: {0}")]
    ResourceLocked(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid broker url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// A step of the channel setup handshake that failed or never confirmed.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("{step} was not confirmed within {}ms", .timeout.as_millis())]
    Timeout { step: SetupStep, timeout: Duration },

    #[error("{step} failed: {source}")]
    Step {
        step: SetupStep,
        #[source]
        source: TransportError,
    },
}

/// An inbound job body or an inbound reply body that cannot be used.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("payload is missing the '{0}' field")]
    MissingField(&'static str),

    #[error("inconsistent reply: {0}")]
    InconsistentReply(&'static str),
}

/// Failure surfaced by the pipeline executor. The message text is what the
/// requester sees in the `error` field of an `incomplete` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PipelineError {
    message: String,
}

impl PipelineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a reply or status record could not be handed to the broker.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply channel is not open")]
    ChannelUnavailable,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures seen by the job submission client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no reply received within {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("reply queue consumer ended before a reply arrived")]
    ReplyStreamClosed,

    #[error("malformed reply: {0}")]
    MalformedReply(#[source] serde_json::Error),
}

/// Failures of the optional push-notification channel.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),

    #[error("notification server did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("notification server rejected the session: {0}")]
    Rejected(String),

    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}
