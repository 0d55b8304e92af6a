//! Step Execution
//!
//! Launching jobs, polling them and driving a protocol to completion.
//!
//! # Architecture
//!
//! - [`launcher`]: the [`JobLauncher`] interface and serializable handles
//! - [`local`] and [`queue`]: local process and batch queue backends
//! - [`script`]: bash wrapper writing logs and exit-code markers
//! - [`status`]: aggregate protocol status from step statuses
//! - [`streaming`]: growing the step graph of streaming protocols
//! - [`scheduler`]: the per-protocol [`SchedulerLoop`]

pub mod launcher;
pub mod local;
pub mod queue;
pub mod scheduler;
pub mod script;
pub mod status;
pub mod streaming;

pub use launcher::{
    launcher_from_config, JobHandle, JobId, JobLauncher, JobRequest, JobStatus, LaunchError, LogPaths,
};
pub use local::{LocalLauncher, HOST_NAME};
pub use queue::QueueLauncher;
pub use scheduler::{LoopSummary, SchedulerError, SchedulerLoop, StopHandle};
pub use status::aggregate_status;
pub use streaming::{InputUnavailableError, SourceUpdate, StepSource, StreamOutcome, StreamingController};
