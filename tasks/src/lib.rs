//! Data plane of the distributed task queue: the task record, the manager
//! holding every persistence and queue-membership operation, the publisher
//! façade, and the status aggregation consumed by operator tooling.
//!
//! Execution lives elsewhere; nothing in this crate runs a task.

mod macros;
mod manager;
mod publish;
mod status;
mod task;

// Re-export
pub use manager::{
    TaskManager, TaskManagerError, TaskManagerOpts, TaskManagerResult, DEFAULT_CHANNEL,
    DEFAULT_EXPIRES, DEFAULT_LIVENESS_THRESHOLD, DEFAULT_PREFIX,
};
pub use publish::TaskPublisher;
pub use status::{ChannelStatus, QueueStatus};
pub use task::{unix_now, RunnerDescriptor, RunnerStatus, Task, TaskStatus};
