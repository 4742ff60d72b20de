//! Task Orchestrator - drives change requests through the agent
//!
//! `received -> processing -> complete | failed`. Each accepted request gets
//! one agent process and one driver task that owns the process's event
//! channel, so a task's output is only ever appended from one place.

use super::Broadcaster;
use crate::agent::{build_prompt, extract, CommitInfo};
use crate::memory::{render_context, BeadStore, ElementDescriptor};
use crate::tasks::{TaskStore, MAX_TASKS};
use crate::types::{ChangeRequest, Task, TaskOutcome, TaskStatus};
use chrono::{DateTime, Utc};
use markupd_runner::{
    ProcessEvent, ProcessHandle, ProcessSupervisor, SpawnSpec, DEFAULT_CHANNEL_CAPACITY,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variables passed through to the agent by default
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["HOME", "PATH", "USER", "TERM", "ANTHROPIC_API_KEY"];

/// How the agent executable is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: PathBuf,
    /// Arguments placed before the prompt
    pub base_args: Vec<String>,
    /// Flag that carries a model hint, e.g. `--model`. Hints are dropped when unset.
    pub model_flag: Option<String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            base_args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model_flag: Some("--model".to_string()),
        }
    }
}

impl AgentCommand {
    /// Full argument list; the prompt always goes last
    pub fn args(&self, prompt: &str, model_hint: Option<&str>) -> Vec<String> {
        let mut args = self.base_args.clone();
        if let (Some(flag), Some(hint)) = (&self.model_flag, model_hint) {
            let hint = hint.trim();
            if !hint.is_empty() {
                args.push(flag.clone());
                args.push(hint.to_string());
            }
        }
        args.push(prompt.to_string());
        args
    }
}

/// Options for creating a TaskOrchestrator
pub struct OrchestratorOptions {
    /// Registry snapshot path. In-memory only when `None`.
    pub tasks_path: Option<PathBuf>,
    /// Registry cap
    pub max_tasks: usize,
    pub agent: AgentCommand,
    /// Host environment variables the agent may see
    pub env_allowlist: Vec<String>,
    /// Mirror each task's output to `<logs_dir>/task-<id>.log`
    pub logs_dir: Option<PathBuf>,
    /// Kill the agent after this long. No limit when `None`.
    pub task_timeout: Option<Duration>,
    /// Broadcast a task update for every output chunk
    pub notify_on_output: bool,
    /// Capacity of each agent's event channel
    pub channel_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            tasks_path: None,
            max_tasks: MAX_TASKS,
            agent: AgentCommand::default(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            logs_dir: None,
            task_timeout: None,
            notify_on_output: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::DuplicateTask(_) => "duplicate_task",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::ShuttingDown => "shutting_down",
        }
    }
}

/// An accepted request
///
/// `outcome` resolves exactly once when the task reaches a terminal state.
/// It is closed without a value if the orchestrator shuts down first.
#[derive(Debug)]
pub struct Submission {
    pub task_id: String,
    pub outcome: oneshot::Receiver<TaskOutcome>,
}

type RunningMap = HashMap<String, Arc<ProcessHandle>>;

/// State shared with driver tasks
struct Shared {
    store: Arc<TaskStore>,
    beads: Arc<BeadStore>,
    broadcaster: Arc<Broadcaster>,
    running: StdMutex<RunningMap>,
    shutting_down: AtomicBool,
    notify_on_output: bool,
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, RunningMap> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Task Orchestrator
pub struct TaskOrchestrator {
    shared: Arc<Shared>,
    agent: AgentCommand,
    env_allowlist: Vec<String>,
    logs_dir: Option<PathBuf>,
    task_timeout: Option<Duration>,
    channel_capacity: usize,
    shutdown_tx: broadcast::Sender<()>,
}

impl TaskOrchestrator {
    /// Create an orchestrator, loading the task registry if one is configured
    pub async fn new(options: OrchestratorOptions, broadcaster: Arc<Broadcaster>) -> Self {
        let store = match &options.tasks_path {
            Some(path) => TaskStore::open(path, options.max_tasks).await,
            None => TaskStore::in_memory(options.max_tasks),
        };

        for id in store.recovered_in_flight() {
            warn!(task_id = %id, "Task was in flight when the previous run stopped; outcome unknown");
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            agent = %options.agent.program.display(),
            max_tasks = store.max_tasks(),
            timeout_secs = ?options.task_timeout.map(|d| d.as_secs()),
            "TaskOrchestrator initialized"
        );

        Self {
            shared: Arc::new(Shared {
                store: Arc::new(store),
                beads: Arc::new(BeadStore::new()),
                broadcaster,
                running: StdMutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                notify_on_output: options.notify_on_output,
            }),
            agent: options.agent,
            env_allowlist: options.env_allowlist,
            logs_dir: options.logs_dir,
            task_timeout: options.task_timeout,
            channel_capacity: options.channel_capacity.max(1),
            shutdown_tx,
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.shared.store
    }

    /// Accept a change request and start its agent.
    ///
    /// Returns as soon as the process is launched. A launch failure is not an
    /// error here: the task is recorded as failed and `outcome` says so.
    pub async fn submit(&self, request: ChangeRequest) -> Result<Submission, OrchestratorError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        if request.feedback_text.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("feedback is empty".to_string()));
        }

        let task_id = match request.id.as_deref().map(str::trim) {
            Some("") => return Err(OrchestratorError::InvalidRequest("task id is empty".to_string())),
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        if self.shared.store.contains(&task_id).await {
            return Err(OrchestratorError::DuplicateTask(task_id));
        }

        let memory = self
            .shared
            .beads
            .load(&request.project_path, &request.element_descriptor)
            .await
            .and_then(|bead| render_context(&bead));

        let prompt = build_prompt(
            &request.feedback_text,
            &request.element_descriptor,
            request.page_url.as_deref(),
            memory.as_deref(),
        );

        let task = Task::new(task_id.clone(), &request, Utc::now());
        if !self.shared.store.insert(task.clone()).await {
            return Err(OrchestratorError::DuplicateTask(task_id));
        }
        self.shared.broadcaster.notify(&task);

        info!(
            task_id = %task_id,
            element = %task.element_key,
            project = %request.project_path.display(),
            has_memory = memory.is_some(),
            "Task created"
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        let mut run = TaskRun {
            shared: Arc::clone(&self.shared),
            task,
            descriptor: request.element_descriptor.clone(),
            log: self.logs_dir.as_deref().map(|dir| TaskLog::new(dir, &task_id)),
            ack: ack_tx,
        };

        let spec = SpawnSpec {
            program: self.agent.program.clone(),
            args: self.agent.args(&prompt, request.model_hint.as_deref()),
            cwd: request.project_path.clone(),
            env: self.agent_env(),
            channel_capacity: self.channel_capacity,
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        match ProcessSupervisor::start(spec) {
            Ok((handle, events)) => {
                let handle = Arc::new(handle);
                info!(task_id = %task_id, pid = ?handle.pid(), "Agent started");
                self.shared
                    .running()
                    .insert(task_id.clone(), Arc::clone(&handle));

                // shutdown() may have drained `running` before the insert
                if self.shared.shutting_down.load(Ordering::SeqCst) {
                    self.shared.running().remove(&task_id);
                    handle.kill().await;
                    debug!(task_id = %task_id, "Agent killed, orchestrator shutting down");
                    return Ok(Submission {
                        task_id,
                        outcome: ack_rx,
                    });
                }

                let timeout = self.task_timeout;
                tokio::spawn(async move {
                    run.drive(handle, events, shutdown_rx, timeout).await;
                });
            }
            Err(e) => {
                let message = format!("Failed to start agent: {}", e);
                warn!(task_id = %task_id, error = %e, "Agent spawn failed");
                run.on_output(&format!("{}\n", message)).await;
                run.finish(Exit::SpawnFailed(message)).await;
            }
        }

        Ok(Submission {
            task_id,
            outcome: ack_rx,
        })
    }

    /// Kill every running agent.
    ///
    /// Their tasks stay `processing` and their submitters receive nothing.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let handles: Vec<(String, Arc<ProcessHandle>)> = self.shared.running().drain().collect();
        let count = handles.len();
        for (task_id, handle) in handles {
            if handle.kill().await {
                info!(task_id = %task_id, "Agent killed on shutdown");
            }
        }

        info!(abandoned = count, "TaskOrchestrator stopped");
    }

    /// All resident tasks, most recent first
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.shared.store.list().await
    }

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.shared.store.get(id).await
    }

    pub async fn task_output(&self, id: &str) -> Option<String> {
        self.shared.store.output(id).await
    }

    /// Number of agent processes currently running
    pub fn running_count(&self) -> usize {
        self.shared.running().len()
    }

    /// Tasks found in `processing` state when the registry was loaded
    pub fn recovered_in_flight(&self) -> &[String] {
        self.shared.store.recovered_in_flight()
    }

    fn agent_env(&self) -> Vec<(String, String)> {
        self.env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect()
    }
}

/// How an agent run ended
#[derive(Debug)]
enum Exit {
    Code(Option<i32>),
    TimedOut(Duration),
    SpawnFailed(String),
}

/// One task's lifecycle after admission
struct TaskRun {
    shared: Arc<Shared>,
    /// Local copy, kept in step with the store; survives eviction
    task: Task,
    descriptor: ElementDescriptor,
    log: Option<TaskLog>,
    ack: oneshot::Sender<TaskOutcome>,
}

impl TaskRun {
    async fn drive(
        mut self,
        handle: Arc<ProcessHandle>,
        mut events: mpsc::Receiver<ProcessEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
        timeout: Option<Duration>,
    ) {
        let deadline = timeout.map(|d| (Instant::now() + d, d));
        let mut timed_out: Option<Duration> = None;

        let exit = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ProcessEvent::Output { chunk, .. }) => {
                        if self.shared.shutting_down.load(Ordering::SeqCst) {
                            continue;
                        }
                        self.on_output(&chunk).await;
                    }
                    Some(ProcessEvent::Exited { code }) => {
                        break match timed_out {
                            Some(limit) => Exit::TimedOut(limit),
                            None => Exit::Code(code),
                        };
                    }
                    None => break Exit::Code(None),
                },
                _ = sleep_until(deadline.map(|(at, _)| at)), if timed_out.is_none() => {
                    let limit = deadline.map(|(_, d)| d).unwrap_or_default();
                    warn!(task_id = %self.task.id, timeout = ?limit, "Agent timed out, killing");
                    timed_out = Some(limit);
                    handle.kill().await;
                }
                Ok(()) = shutdown_rx.recv() => {
                    debug!(task_id = %self.task.id, "Driver stopping on shutdown");
                    handle.kill().await;
                    return;
                }
            }
        };

        if self.shared.shutting_down.load(Ordering::SeqCst) {
            debug!(task_id = %self.task.id, "Task abandoned on shutdown");
            return;
        }
        self.shared.running().remove(&self.task.id);
        self.finish(exit).await;
    }

    async fn on_output(&mut self, chunk: &str) {
        if !self.task.append_output(chunk) {
            return;
        }
        let updated = self
            .shared
            .store
            .update(&self.task.id, |t| t.append_output(chunk))
            .await;

        if let Some(log) = self.log.as_mut() {
            log.write(chunk).await;
        }

        if self.shared.notify_on_output {
            if let Some(task) = updated {
                self.shared.broadcaster.notify(&task);
            }
        }
    }

    async fn finish(mut self, exit: Exit) {
        let now = Utc::now();
        let resolution = match exit {
            Exit::Code(Some(0)) => Resolution::Complete(extract(&self.task.output)),
            Exit::Code(Some(code)) => Resolution::Fail {
                code: Some(code),
                error: format!("Agent exited with code {}", code),
            },
            Exit::Code(None) => Resolution::Fail {
                code: None,
                error: "Agent terminated without an exit code".to_string(),
            },
            Exit::TimedOut(limit) => {
                let error = format!("Timed out after {:?}", limit);
                if let Some(log) = self.log.as_mut() {
                    log.write(&format!("{}\n", error)).await;
                }
                Resolution::Fail { code: None, error }
            }
            Exit::SpawnFailed(error) => Resolution::Fail { code: None, error },
        };

        if !resolution.apply(&mut self.task, now) {
            return;
        }
        let stored = self
            .shared
            .store
            .update(&self.task.id, |t| resolution.apply(t, now))
            .await;

        self.shared
            .beads
            .save(
                &self.task.project_path,
                &self.descriptor,
                &self.task.feedback_text,
                &self.task.id,
                self.task.status == TaskStatus::Complete,
            )
            .await;

        match &stored {
            Some(task) => {
                self.shared.broadcaster.notify(task);
            }
            None => debug!(task_id = %self.task.id, "Task no longer resident, result not stored"),
        }

        info!(
            task_id = %self.task.id,
            status = %self.task.status,
            exit_code = ?self.task.exit_code,
            commit = ?self.task.commit_hash,
            "Task finished"
        );

        if self.ack.send(self.task.outcome()).is_err() {
            debug!(task_id = %self.task.id, "Submitter no longer waiting for result");
        }
    }
}

/// Terminal transition applied to both the local copy and the stored task
enum Resolution {
    Complete(CommitInfo),
    Fail { code: Option<i32>, error: String },
}

impl Resolution {
    fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> bool {
        match self {
            Resolution::Complete(commit) => task.complete(0, commit.clone(), now),
            Resolution::Fail { code, error } => task.fail(*code, Some(error.clone()), now),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Append-only mirror of one task's output
struct TaskLog {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    disabled: bool,
}

impl TaskLog {
    fn new(dir: &Path, task_id: &str) -> Self {
        Self {
            path: task_log_path(dir, task_id),
            file: None,
            disabled: false,
        }
    }

    async fn write(&mut self, chunk: &str) {
        if self.disabled {
            return;
        }
        if self.file.is_none() {
            match self.open().await {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Cannot open task log");
                    self.disabled = true;
                    return;
                }
            }
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(chunk.as_bytes()).await {
                warn!(path = %self.path.display(), error = %e, "Task log write failed");
                self.disabled = true;
            }
        }
    }

    async fn open(&self) -> std::io::Result<tokio::fs::File> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }
}

/// Log file for a task. Characters outside `[A-Za-z0-9._-]` in the id are replaced.
pub fn task_log_path(dir: &Path, task_id: &str) -> PathBuf {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("task-{}.log", safe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_args_default() {
        let agent = AgentCommand::default();
        assert_eq!(
            agent.args("do it", None),
            vec!["--print", "--dangerously-skip-permissions", "do it"]
        );
        assert_eq!(
            agent.args("do it", Some("sonnet")),
            vec!["--print", "--dangerously-skip-permissions", "--model", "sonnet", "do it"]
        );
        assert_eq!(agent.args("p", Some("  ")).len(), 3);
    }

    #[test]
    fn test_agent_args_without_model_flag() {
        let agent = AgentCommand {
            program: PathBuf::from("/bin/sh"),
            base_args: vec!["-c".to_string(), "echo hi".to_string()],
            model_flag: None,
        };
        assert_eq!(agent.args("prompt", Some("opus")), vec!["-c", "echo hi", "prompt"]);
    }

    #[test]
    fn test_task_log_path_is_sanitized() {
        let dir = Path::new("/var/log/markupd");
        assert_eq!(
            task_log_path(dir, "abc-123"),
            PathBuf::from("/var/log/markupd/task-abc-123.log")
        );
        assert_eq!(
            task_log_path(dir, "../../etc/passwd"),
            PathBuf::from("/var/log/markupd/task-.._.._etc_passwd.log")
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(OrchestratorError::DuplicateTask("x".into()).code(), "duplicate_task");
        assert_eq!(OrchestratorError::ShuttingDown.code(), "shutting_down");
    }

    #[tokio::test]
    async fn test_rejects_blank_feedback() {
        let orchestrator =
            TaskOrchestrator::new(OrchestratorOptions::default(), Arc::new(Broadcaster::new())).await;
        let request = ChangeRequest {
            id: None,
            feedback_text: "  ".to_string(),
            element_descriptor: ElementDescriptor::new("p"),
            project_path: PathBuf::from("/tmp"),
            page_url: None,
            model_hint: None,
        };
        let err = orchestrator.submit(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
        assert!(orchestrator.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let orchestrator =
            TaskOrchestrator::new(OrchestratorOptions::default(), Arc::new(Broadcaster::new())).await;
        orchestrator.shutdown().await;
        let request = ChangeRequest {
            id: None,
            feedback_text: "x".to_string(),
            element_descriptor: ElementDescriptor::new("p"),
            project_path: PathBuf::from("/tmp"),
            page_url: None,
            model_hint: None,
        };
        assert!(matches!(
            orchestrator.submit(request).await,
            Err(OrchestratorError::ShuttingDown)
        ));
    }
}
