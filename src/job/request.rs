//! Job request payloads
//!
//! The payload is opaque to the relay: it is validated just enough to know it
//! is a job document and then handed to the pipeline executor unmodified.
//! Correlation id and reply-to travel as message properties, never in the body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::DecodeError;

/// Identifier the web backend assigns to a job. The backend has sent both
/// `"57"` and `57`, so either shape is accepted and echoed back as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobId::Number(n) => write!(f, "{n}"),
            JobId::Text(s) => f.write_str(s),
        }
    }
}

/// A validated job document.
///
/// The body bytes are kept as received and are what the pipeline gets; the
/// parsed document only serves validation and field lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPayload {
    raw: Vec<u8>,
    document: Value,
}

impl JobPayload {
    pub const GEOJSON_FIELD: &'static str = "geoJson";
    pub const ID_FIELD: &'static str = "id";

    /// Builds a payload from a JSON document, applying the same checks as
    /// [`JobPayload::decode`].
    pub fn from_value(document: Value) -> Result<Self, DecodeError> {
        Self::decode(&serde_json::to_vec(&document)?)
    }

    /// Decodes a raw message body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice(body)? {
            // Some producers serialize the document twice.
            Value::String(inner) => {
                let document = serde_json::from_str(&inner)?;
                Self::validated(inner.into_bytes(), document)
            }
            document => Self::validated(body.to_vec(), document),
        }
    }

    fn validated(raw: Vec<u8>, document: Value) -> Result<Self, DecodeError> {
        let Value::Object(fields) = &document else {
            return Err(DecodeError::NotAnObject);
        };
        if fields.get(Self::GEOJSON_FIELD).is_none_or(Value::is_null) {
            return Err(DecodeError::MissingField(Self::GEOJSON_FIELD));
        }
        Ok(Self { raw, document })
    }

    /// The document bytes exactly as the producer wrote them.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn geo_json(&self) -> &Value {
        &self.document[Self::GEOJSON_FIELD]
    }

    /// The job id, if present and of a supported shape.
    pub fn job_id(&self) -> Option<JobId> {
        self.document
            .get(Self::ID_FIELD)
            .and_then(|id| JobId::deserialize(id).ok())
    }
}
