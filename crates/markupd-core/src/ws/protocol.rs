//! Message protocol
//!
//! JSON text frames tagged by `type`. Inbound frames are validated here and
//! nowhere else; anything that does not decode into [`Inbound`] becomes a
//! [`ProtocolError`] which the server reports back as an `error` frame.

use crate::types::{ChangeRequest, Task, TaskOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const INBOUND_TYPES: &[&str] = &["submit_change", "list_tasks", "get_task_output", "ping"];

/// Messages from a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    SubmitChange(ChangeRequest),
    ListTasks,
    GetTaskOutput {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    Ping,
}

/// Messages to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    TaskStarted {
        #[serde(rename = "taskStarted")]
        task_started: bool,
        #[serde(rename = "taskId")]
        task_id: String,
    },
    TaskResult(TaskOutcome),
    TaskList {
        tasks: Vec<Task>,
    },
    TaskOutput {
        #[serde(rename = "taskId")]
        task_id: String,
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    TaskUpdate {
        task: Task,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl Outbound {
    pub fn started(task_id: impl Into<String>) -> Self {
        Outbound::TaskStarted {
            task_started: true,
            task_id: task_id.into(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Outbound::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&ProtocolError> for Outbound {
    fn from(err: &ProtocolError) -> Self {
        Outbound::error(err.code(), err.to_string())
    }
}

/// Protocol violations. None of these close the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no \"type\" field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {reason}")]
    Invalid { kind: String, reason: String },

    #[error("Binary frames are not supported")]
    Binary,
}

impl ProtocolError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::Invalid { .. } => "invalid_message",
            ProtocolError::Binary => "unsupported_frame",
        }
    }
}

/// Decode and validate one inbound text frame
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let Value::Object(ref map) = value else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };

    let kind = match map.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(ProtocolError::MissingType),
    };
    if !INBOUND_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    let inbound: Inbound = serde_json::from_value(value).map_err(|e| ProtocolError::Invalid {
        kind: kind.clone(),
        reason: e.to_string(),
    })?;

    if let Inbound::SubmitChange(ref request) = inbound {
        validate_request(request).map_err(|reason| ProtocolError::Invalid { kind, reason })?;
    }
    Ok(inbound)
}

fn validate_request(request: &ChangeRequest) -> Result<(), String> {
    if request.feedback_text.trim().is_empty() {
        return Err("feedbackText is empty".to_string());
    }
    if request.project_path.as_os_str().is_empty() {
        return Err("projectPath is empty".to_string());
    }
    if matches!(request.id.as_deref(), Some(id) if id.trim().is_empty()) {
        return Err("id is empty".to_string());
    }
    Ok(())
}
