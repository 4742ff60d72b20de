//! markupd-runner - agent process supervisor
//!
//! Spawns one external agent process, streams its stdout/stderr line by line
//! over a bounded channel and reports the exit code as the final event.
//!
//! # Example
//!
//! ```no_run
//! use markupd_runner::{ProcessEvent, ProcessSupervisor, SpawnSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), markupd_runner::RunnerError> {
//!     let spec = SpawnSpec::new("claude", "/path/to/project")
//!         .arg("--print")
//!         .arg("Make the header blue");
//!
//!     let (handle, mut events) = ProcessSupervisor::start(spec)?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ProcessEvent::Output { chunk, .. } => print!("{}", chunk),
//!             ProcessEvent::Exited { code } => println!("exited: {:?}", code),
//!         }
//!     }
//!     assert!(!handle.is_running());
//!     Ok(())
//! }
//! ```

mod supervisor;
mod types;

pub use supervisor::{ProcessHandle, ProcessSupervisor};
pub use types::*;
