//! Core engine
//!
//! - `broadcaster`: fan-out of task updates to observers
//! - `orchestrator`: task lifecycle and agent supervision

mod broadcaster;
mod orchestrator;

pub use broadcaster::{Broadcaster, Frame, ObserverId, ObserverReceiver, OBSERVER_CHANNEL_CAPACITY};
pub use orchestrator::{
    task_log_path, AgentCommand, OrchestratorError, OrchestratorOptions, Submission,
    TaskOrchestrator, DEFAULT_ENV_ALLOWLIST,
};
