//! The `job` module holds the messages exchanged between a requester and a
//! worker: the job payload, the correlated reply, and the status record.

pub mod reply;
pub mod request;
pub mod status;

pub use reply::{JobReply, JobStatus, ResultLocators};
pub use request::{JobId, JobPayload};
pub use status::StatusRecord;
