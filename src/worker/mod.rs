//! The job-RPC worker: connection lifecycle, channel topology, job dispatch,
//! reply and status publication.

pub mod controller;
pub mod dispatcher;
pub mod pipeline;
pub mod reply;
pub mod shutdown;
pub mod state;
pub mod status;
pub mod topology;

pub use controller::{Worker, WorkerOptions};
pub use dispatcher::{Completed, JobDispatcher};
pub use pipeline::{CommandExecutor, JobContext, PipelineExecutor};
pub use reply::ReplyPublisher;
pub use shutdown::ShutdownHandle;
pub use state::{Phase, ReconnectPolicy};
pub use status::{StatusReporter, StatusUpdate};
pub use topology::{SetupStep, Topology};
