//! Job replies
//!
//! A reply is built exactly once per accepted inbound message. The two
//! constructors are the only way to build one, so `complete` always carries
//! both result locators and no error, and `incomplete` always carries an error
//! and no locators. Decoding re-checks the same rule.

use serde::{Deserialize, Serialize};

use crate::job::request::JobId;
use crate::utils::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Complete,
    Incomplete,
}

/// Result locators produced by a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLocators {
    #[serde(rename = "resultImageURL")]
    pub image_url: String,
    #[serde(rename = "resultShapefileURL")]
    pub shapefile_url: String,
}

impl ResultLocators {
    pub fn new(image_url: impl Into<String>, shapefile_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            shapefile_url: shapefile_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireReply")]
pub struct JobReply {
    #[serde(rename = "correlationId")]
    correlation_id: String,
    #[serde(rename = "resultImageURL")]
    result_image_url: Option<String>,
    #[serde(rename = "resultShapefileURL")]
    result_shapefile_url: Option<String>,
    #[serde(rename = "jobStatus")]
    job_status: JobStatus,
    #[serde(rename = "jobId")]
    job_id: Option<JobId>,
    error: Option<String>,
}

impl JobReply {
    pub fn complete(
        correlation_id: impl Into<String>,
        job_id: Option<JobId>,
        locators: ResultLocators,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result_image_url: Some(locators.image_url),
            result_shapefile_url: Some(locators.shapefile_url),
            job_status: JobStatus::Complete,
            job_id,
            error: None,
        }
    }

    pub fn incomplete(
        correlation_id: impl Into<String>,
        job_id: Option<JobId>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result_image_url: None,
            result_shapefile_url: None,
            job_status: JobStatus::Incomplete,
            job_id,
            error: Some(error.into()),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> JobStatus {
        self.job_status
    }

    pub fn is_complete(&self) -> bool {
        self.job_status == JobStatus::Complete
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn locators(&self) -> Option<ResultLocators> {
        match (&self.result_image_url, &self.result_shapefile_url) {
            (Some(image), Some(shapefile)) => Some(ResultLocators::new(image, shapefile)),
            _ => None,
        }
    }
}

/// Unchecked shape of a reply on the wire.
#[derive(Deserialize)]
struct WireReply {
    #[serde(rename = "correlationId", default)]
    correlation_id: Option<String>,
    #[serde(rename = "resultImageURL", default)]
    result_image_url: Option<String>,
    #[serde(rename = "resultShapefileURL", default)]
    result_shapefile_url: Option<String>,
    #[serde(rename = "jobStatus")]
    job_status: JobStatus,
    #[serde(rename = "jobId", default)]
    job_id: Option<JobId>,
    #[serde(default)]
    error: Option<String>,
}

impl TryFrom<WireReply> for JobReply {
    type Error = DecodeError;

    fn try_from(wire: WireReply) -> Result<Self, Self::Error> {
        let correlation_id = wire.correlation_id.unwrap_or_default();
        match wire.job_status {
            JobStatus::Complete => {
                if wire.error.is_some() {
                    return Err(DecodeError::InconsistentReply(
                        "complete reply carries an error",
                    ));
                }
                match (wire.result_image_url, wire.result_shapefile_url) {
                    (Some(image), Some(shapefile)) => Ok(JobReply::complete(
                        correlation_id,
                        wire.job_id,
                        ResultLocators::new(image, shapefile),
                    )),
                    _ => Err(DecodeError::InconsistentReply(
                        "complete reply is missing result locators",
                    )),
                }
            }
            JobStatus::Incomplete => {
                if wire.result_image_url.is_some() || wire.result_shapefile_url.is_some() {
                    return Err(DecodeError::InconsistentReply(
                        "incomplete reply carries result locators",
                    ));
                }
                match wire.error {
                    Some(error) => Ok(JobReply::incomplete(correlation_id, wire.job_id, error)),
                    None => Err(DecodeError::InconsistentReply(
                        "incomplete reply is missing an error",
                    )),
                }
            }
        }
    }
}
