//! Agent-facing text: the prompt going in and the commit details coming out

mod parser;
mod prompt;

pub use parser::{extract, CommitInfo};
pub use prompt::{build_prompt, COMMIT_MARKER};
