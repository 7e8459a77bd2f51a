//! Control plane of the distributed task queue: one [`TaskEngine`] per
//! worker process. It subscribes to its channels, feeds incoming task ids
//! into a bounded worker pool, walks each task through the shared lifecycle
//! state, heartbeats its own liveness, and recovers orphaned work on start.

mod engine;
mod message;
mod registry;

// Re-export
pub use engine::{
    default_hostname, EngineError, EngineOpts, EngineResult, EngineState, TaskEngine,
    BROADCAST_CHANNEL,
};
pub use message::ControlMessage;
pub use registry::{TaskFuture, TaskHandler, TaskInvocation, TaskRegistry};
