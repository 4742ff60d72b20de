//! Beads - per-element change memory
//!
//! One JSON document per element key under `<project>/.markupd/beads/`.
//! Every read and write here is best-effort: failures are logged and the
//! caller carries on as if there were no history.

use super::element::{derive_key, ElementDescriptor, ElementKey};
use crate::persist::{read_json, write_json_atomic, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum change records kept per bead
pub const MAX_BEAD_CHANGES: usize = 10;

/// Number of recent changes rendered into a prompt
pub const CONTEXT_CHANGES: usize = 3;

const MEMORY_DIR: &str = ".markupd";
const BEADS_DIR: &str = "beads";

/// One past change request against an element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub task_id: String,
    pub feedback: String,
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
}

/// Memory record for a single element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bead {
    pub key: ElementKey,
    /// Descriptor as last seen
    pub element: ElementDescriptor,
    /// Chronological, capped at `MAX_BEAD_CHANGES`
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
}

impl Bead {
    pub fn new(descriptor: &ElementDescriptor) -> Self {
        Self {
            key: derive_key(descriptor),
            element: descriptor.clone(),
            changes: Vec::new(),
        }
    }

    /// Append a change, evicting the oldest ones beyond the cap
    pub fn record(&mut self, change: ChangeRecord) {
        self.changes.push(change);
        if self.changes.len() > MAX_BEAD_CHANGES {
            let excess = self.changes.len() - MAX_BEAD_CHANGES;
            self.changes.drain(..excess);
        }
    }
}

/// Render the last few changes of a bead for inclusion in a prompt.
///
/// Returns `None` when there is no history.
pub fn render_context(bead: &Bead) -> Option<String> {
    if bead.changes.is_empty() {
        return None;
    }

    let start = bead.changes.len().saturating_sub(CONTEXT_CHANGES);
    let mut out = String::from("Previous changes to this element (oldest first):\n");
    for change in &bead.changes[start..] {
        let marker = if change.succeeded { "✓" } else { "✗" };
        out.push_str(&format!(
            "- {} {} \"{}\"\n",
            change.timestamp.format("%Y-%m-%d %H:%M"),
            marker,
            change.feedback.trim()
        ));
    }
    Some(out)
}

/// File-backed bead store
pub struct BeadStore {
    /// Serialises load-modify-write cycles
    write_lock: Mutex<()>,
}

impl Default for BeadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BeadStore {
    pub fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
        }
    }

    /// Location of an element's bead inside a project
    pub fn bead_path(project: &Path, key: &ElementKey) -> PathBuf {
        project
            .join(MEMORY_DIR)
            .join(BEADS_DIR)
            .join(format!("{}.json", key))
    }

    /// Load the bead for an element, if one exists and is readable
    pub async fn load(&self, project: &Path, descriptor: &ElementDescriptor) -> Option<Bead> {
        let key = derive_key(descriptor);
        let path = Self::bead_path(project, &key);
        match read_json::<Bead>(&path).await {
            Ok(bead) => Some(bead),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable bead");
                None
            }
        }
    }

    /// Record the outcome of a task against an element
    pub async fn save(
        &self,
        project: &Path,
        descriptor: &ElementDescriptor,
        feedback: &str,
        task_id: &str,
        succeeded: bool,
    ) {
        let change = ChangeRecord {
            task_id: task_id.to_string(),
            feedback: feedback.to_string(),
            timestamp: Utc::now(),
            succeeded,
        };
        if let Err(e) = self.append(project, descriptor, change).await {
            warn!(task_id = %task_id, error = %e, "Failed to save bead");
        }
    }

    async fn append(
        &self,
        project: &Path,
        descriptor: &ElementDescriptor,
        change: ChangeRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut bead = self
            .load(project, descriptor)
            .await
            .unwrap_or_else(|| Bead::new(descriptor));
        bead.element = descriptor.clone();
        bead.record(change);

        let path = Self::bead_path(project, &bead.key);
        write_json_atomic(&path, &bead).await?;
        debug!(key = %bead.key, changes = bead.changes.len(), "Bead saved");
        Ok(())
    }
}
