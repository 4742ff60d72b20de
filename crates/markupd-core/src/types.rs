//! Core types for markupd

use crate::agent::CommitInfo;
use crate::memory::{derive_key, ElementDescriptor, ElementKey, ElementSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Exit code recorded when the agent never produced one
/// (spawn failure, killed by signal, timed out).
pub const NO_EXIT_CODE: i32 = -1;

// ============ Change Request ============

/// A change request submitted by the markup UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    /// Caller-supplied task id. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub feedback_text: String,
    pub element_descriptor: ElementDescriptor,
    pub project_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

// ============ Task ============

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Processing)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One agent invocation, tracked end to end
///
/// `completed_at` and `exit_code` are set exactly when the status is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub feedback_text: String,
    pub element: ElementSummary,
    pub element_key: ElementKey,
    pub project_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated agent output (stdout and stderr, arrival order)
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_url: Option<String>,
    /// Spawn fault, timeout or abnormal termination detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a task in `processing` state from an accepted request
    pub fn new(id: String, request: &ChangeRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            feedback_text: request.feedback_text.clone(),
            element: ElementSummary::from(&request.element_descriptor),
            element_key: derive_key(&request.element_descriptor),
            project_path: request.project_path.clone(),
            page_url: request.page_url.clone(),
            model_hint: request.model_hint.clone(),
            status: TaskStatus::Processing,
            started_at: now,
            completed_at: None,
            output: String::new(),
            exit_code: None,
            commit_hash: None,
            commit_url: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append an output chunk. Ignored once the task is terminal.
    pub fn append_output(&mut self, chunk: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.output.push_str(chunk);
        true
    }

    /// `processing -> complete`
    pub fn complete(&mut self, exit_code: i32, commit: CommitInfo, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Complete;
        self.exit_code = Some(exit_code);
        self.completed_at = Some(now);
        self.commit_hash = commit.hash;
        self.commit_url = commit.url;
        true
    }

    /// `processing -> failed`
    pub fn fail(&mut self, exit_code: Option<i32>, error: Option<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.exit_code = Some(exit_code.unwrap_or(NO_EXIT_CODE));
        self.completed_at = Some(now);
        self.error = error;
        true
    }

    /// Whether the agent process could not be started at all
    pub fn spawn_failed(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.exit_code == Some(NO_EXIT_CODE)
            && matches!(self.error.as_deref(), Some(e) if self.output.trim_end() == e)
    }

    /// Terminal acknowledgement for the requester
    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            task_id: self.id.clone(),
            success: self.status == TaskStatus::Complete,
            status: self.status,
            exit_code: self.exit_code,
            commit_hash: self.commit_hash.clone(),
            commit_url: self.commit_url.clone(),
            error: self.error.clone(),
        }
    }
}

/// Result delivered once to the submitter of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
