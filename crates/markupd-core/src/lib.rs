//! markupd core
//!
//! Task lifecycle and agent supervision engine: a change request against a
//! DOM element becomes an agent run whose output is streamed, persisted,
//! broadcast to observers and remembered per element.
//!
//! # Example
//!
//! ```no_run
//! use markupd_core::{Broadcaster, ChangeRequest, ElementDescriptor, OrchestratorOptions, TaskOrchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator =
//!         TaskOrchestrator::new(OrchestratorOptions::default(), Arc::new(Broadcaster::new())).await;
//!
//!     let submission = orchestrator
//!         .submit(ChangeRequest {
//!             id: None,
//!             feedback_text: "Make the heading blue".to_string(),
//!             element_descriptor: ElementDescriptor::new("h1"),
//!             project_path: "/path/to/site".into(),
//!             page_url: None,
//!             model_hint: None,
//!         })
//!         .await?;
//!
//!     let outcome = submission.outcome.await?;
//!     println!("{} -> {}", outcome.task_id, outcome.status);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod auth;
pub mod core;
pub mod memory;
pub mod persist;
pub mod tasks;
pub mod types;
pub mod ws;

pub use agent::{build_prompt, extract, CommitInfo};
pub use auth::{SharedToken, TokenValidator};
pub use crate::core::{
    AgentCommand, Broadcaster, OrchestratorError, OrchestratorOptions, Submission,
    TaskOrchestrator,
};
pub use memory::{derive_key, Bead, BeadStore, ElementDescriptor, ElementKey};
pub use tasks::{TaskStore, MAX_TASKS};
pub use types::*;
pub use ws::{Inbound, Outbound, TaskWebSocketServer, WSServerOptions};
