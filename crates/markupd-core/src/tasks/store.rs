//! Task store - bounded registry of task records
//!
//! Keeps the most recent `max_tasks` tasks in insertion order and rewrites
//! the whole registry file after every mutation. Older tasks are dropped for
//! good; this is a cache of recent work, not an archive.

use crate::persist::{read_json, write_atomic};
use crate::types::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default maximum number of resident tasks
pub const MAX_TASKS: usize = 100;

const REGISTRY_VERSION: u32 = 1;

/// On-disk registry document (tasks oldest first)
#[derive(Debug, Deserialize)]
struct Registry {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct RegistryRef<'a> {
    version: u32,
    tasks: &'a VecDeque<Task>,
}

/// Thread-safe task registry with write-through persistence
pub struct TaskStore {
    tasks: RwLock<VecDeque<Task>>,
    /// Held across mutate + flush so snapshots hit the disk in mutation order
    writer: Mutex<()>,
    path: Option<PathBuf>,
    max_tasks: usize,
    /// Tasks that were still `processing` when loaded from disk
    recovered: Vec<String>,
}

impl TaskStore {
    /// A store without a backing file
    pub fn in_memory(max_tasks: usize) -> Self {
        Self {
            tasks: RwLock::new(VecDeque::new()),
            writer: Mutex::new(()),
            path: None,
            max_tasks: max_tasks.max(1),
            recovered: Vec::new(),
        }
    }

    /// Open the registry at `path`, loading whatever snapshot is there.
    ///
    /// A missing or corrupt file yields an empty store.
    pub async fn open(path: impl Into<PathBuf>, max_tasks: usize) -> Self {
        let path = path.into();
        let max_tasks = max_tasks.max(1);

        let mut tasks: VecDeque<Task> = match read_json::<Registry>(&path).await {
            Ok(registry) => {
                if registry.version != REGISTRY_VERSION {
                    warn!(version = registry.version, path = %path.display(), "Unexpected task registry version");
                }
                registry.tasks.into()
            }
            Err(e) if e.is_not_found() => VecDeque::new(),
            Err(e) => {
                warn!(error = %e, "Task registry unreadable, starting empty");
                VecDeque::new()
            }
        };

        while tasks.len() > max_tasks {
            tasks.pop_front();
        }

        let recovered: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Processing)
            .map(|t| t.id.clone())
            .collect();
        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                "Tasks left in processing by a previous run; outcome unknown"
            );
        }

        info!(count = tasks.len(), path = %path.display(), "Task registry loaded");

        Self {
            tasks: RwLock::new(tasks),
            writer: Mutex::new(()),
            path: Some(path),
            max_tasks,
            recovered,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Ids of tasks loaded in `processing` state from a previous run
    pub fn recovered_in_flight(&self) -> &[String] {
        &self.recovered
    }

    /// Insert a new task, evicting the oldest ones beyond capacity.
    ///
    /// Returns `false` (and changes nothing) if the id is already present.
    pub async fn insert(&self, task: Task) -> bool {
        let _writer = self.writer.lock().await;
        {
            let mut tasks = self.tasks.write().await;
            if tasks.iter().any(|t| t.id == task.id) {
                return false;
            }
            tasks.push_back(task);
            while tasks.len() > self.max_tasks {
                if let Some(evicted) = tasks.pop_front() {
                    debug!(task_id = %evicted.id, status = %evicted.status, "Task evicted from registry");
                }
            }
        }
        self.flush().await;
        true
    }

    /// Apply `f` to the task with the given id.
    ///
    /// `f` returns whether it changed anything; only then is the registry
    /// persisted and the updated task returned.
    pub async fn update<F>(&self, id: &str, f: F) -> Option<Task>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let _writer = self.writer.lock().await;
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.iter_mut().rev().find(|t| t.id == id)?;
            if !f(&mut *task) {
                return None;
            }
            task.clone()
        };
        self.flush().await;
        Some(updated)
    }

    /// Get a task by id
    pub async fn get(&self, id: &str) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.iter().rev().find(|t| t.id == id).cloned()
    }

    /// Accumulated output of a task
    pub async fn output(&self, id: &str) -> Option<String> {
        let tasks = self.tasks.read().await;
        tasks
            .iter()
            .rev()
            .find(|t| t.id == id)
            .map(|t| t.output.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        let tasks = self.tasks.read().await;
        tasks.iter().any(|t| t.id == id)
    }

    /// All resident tasks, most recent first
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks.iter().rev().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Write the current snapshot. Caller must hold `writer`.
    async fn flush(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };

        let encoded = {
            let tasks = self.tasks.read().await;
            serde_json::to_vec(&RegistryRef {
                version: REGISTRY_VERSION,
                tasks: &*tasks,
            })
        };

        match encoded {
            Ok(bytes) => {
                if let Err(e) = write_atomic(path, &bytes).await {
                    warn!(error = %e, "Failed to persist task registry");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode task registry"),
        }
    }
}
