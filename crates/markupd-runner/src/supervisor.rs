//! Process supervisor implementation
//!
//! One supervisor run owns exactly one child process. Output lines from
//! stdout and stderr are forwarded in arrival order over a bounded channel;
//! the exit code follows once both pipes are drained, or once
//! [`PIPE_DRAIN_TIMEOUT`] has passed if a descendant keeps them open.
//!
//! On unix the child leads its own process group and a kill signals the
//! whole group.

use crate::types::*;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Launches agent processes
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn the process described by `spec`.
    ///
    /// On success the returned receiver yields `Output` events followed by a
    /// single `Exited`. On failure no event is ever produced.
    pub fn start(
        spec: SpawnSpec,
    ) -> Result<(ProcessHandle, mpsc::Receiver<ProcessEvent>), RunnerError> {
        let SpawnSpec {
            program,
            args,
            cwd,
            env,
            channel_capacity,
        } = spec;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %program.display(), cwd = %cwd.display(), argc = args.len(), "Starting agent process");

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(RunnerError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(RunnerError::Pipe("stderr"))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let stdout_pump = pump(stdout, OutputStream::Stdout, tx.clone());
        let stderr_pump = pump(stderr, OutputStream::Stderr, tx.clone());

        let running = Arc::new(AtomicBool::new(true));
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let running_flag = Arc::clone(&running);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    kill_group(pid);
                    if let Err(e) = child.kill().await {
                        warn!(?pid, error = %e, "Failed to kill agent process");
                    }
                    child.wait().await
                }
            };
            running_flag.store(false, Ordering::SeqCst);

            drain([stdout_pump, stderr_pump], pid).await;

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(?pid, error = %e, "Failed to wait for agent process");
                    None
                }
            };
            debug!(?pid, ?code, "Agent process exited");
            let _ = tx.send(ProcessEvent::Exited { code }).await;
        });

        Ok((
            ProcessHandle {
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
                running,
            },
            rx,
        ))
    }
}

/// Wait for the pumps to reach EOF, up to [`PIPE_DRAIN_TIMEOUT`].
///
/// A descendant that inherited stdout or stderr keeps the pipes open after
/// the child itself has exited; its output is cut off here.
async fn drain(mut pumps: [JoinHandle<()>; 2], pid: Option<u32>) {
    let drained = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, async {
        for pump in pumps.iter_mut() {
            let _ = pump.await;
        }
    })
    .await;

    if drained.is_err() {
        debug!(?pid, "Output pipes held open by a descendant, closing them");
        for pump in &pumps {
            pump.abort();
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "Failed to signal agent process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<ProcessEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(ProcessEvent::Output { stream, chunk }).await.is_err() {
                        // Receiver gone, nobody is listening any more
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = stream.as_str(), error = %e, "Failed to read agent output");
                    break;
                }
            }
        }
    })
}

/// Handle to a running (or finished) agent process
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    running: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// OS process id, if the process was still alive right after spawn
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has not exited yet
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Kill the process.
    ///
    /// Returns `false` when the process had already exited or a kill was
    /// already requested; in that case nothing happens.
    pub async fn kill(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let sender = self.kill_tx.lock().await.take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str, cwd: &std::path::Path) -> SpawnSpec {
        SpawnSpec::new("/bin/sh", cwd).arg("-c").arg(script)
    }

    async fn collect(mut rx: mpsc::Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_streams_output_then_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo one; echo two >&2; echo three; exit 3", dir.path());

        let (_handle, rx) = ProcessSupervisor::start(spec).unwrap();
        let events = collect(rx).await;

        assert_eq!(events.last(), Some(&ProcessEvent::Exited { code: Some(3) }));
        let exits = events
            .iter()
            .filter(|e| matches!(e, ProcessEvent::Exited { .. }))
            .count();
        assert_eq!(exits, 1);

        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    chunk,
                } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one\n", "three\n"]);

        assert!(events.contains(&ProcessEvent::Output {
            stream: OutputStream::Stderr,
            chunk: "two\n".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec::new("/definitely/not/an/agent", dir.path());

        let err = ProcessSupervisor::start(spec).err().unwrap();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert!(err.to_string().contains("/definitely/not/an/agent"));
    }

    #[tokio::test]
    async fn test_environment_is_allow_listed() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo \"[$MARKUPD_TEST_VAR][$CARGO]\"", dir.path())
            .env("MARKUPD_TEST_VAR", "visible");

        let (_handle, rx) = ProcessSupervisor::start(spec).unwrap();
        let events = collect(rx).await;

        assert_eq!(
            events[0],
            ProcessEvent::Output {
                stream: OutputStream::Stdout,
                chunk: "[visible][]\n".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let spec = sh("cat marker.txt", dir.path());

        let (_handle, rx) = ProcessSupervisor::start(spec).unwrap();
        let events = collect(rx).await;

        assert_eq!(
            events[0],
            ProcessEvent::Output {
                stream: OutputStream::Stdout,
                chunk: "here".to_string(),
            }
        );
        assert_eq!(events[1], ProcessEvent::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo started; sleep 30", dir.path());

        let (handle, mut rx) = ProcessSupervisor::start(spec).unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProcessEvent::Output { .. }));
        assert!(handle.is_running());

        assert!(handle.kill().await);
        let last = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert_eq!(last.last(), Some(&ProcessEvent::Exited { code: None }));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_exit_reported_while_descendant_holds_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("sleep 5 & echo done; exit 0", dir.path());

        let started = std::time::Instant::now();
        let (handle, rx) = ProcessSupervisor::start(spec).unwrap();
        let events = tokio::time::timeout(Duration::from_secs(3), collect(rx))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(events.last(), Some(&ProcessEvent::Exited { code: Some(0) }));
        assert!(events.contains(&ProcessEvent::Output {
            stream: OutputStream::Stdout,
            chunk: "done\n".to_string(),
        }));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_kill_reaches_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late.txt");
        let spec = sh("(sleep 1; echo late > late.txt) & echo started; wait", dir.path());

        let (handle, mut rx) = ProcessSupervisor::start(spec).unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProcessEvent::Output { .. }));

        assert!(handle.kill().await);
        let events = tokio::time::timeout(Duration::from_secs(3), collect(rx))
            .await
            .unwrap();
        assert_eq!(events.last(), Some(&ProcessEvent::Exited { code: None }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, rx) = ProcessSupervisor::start(sh("true", dir.path())).unwrap();
        let events = collect(rx).await;
        assert_eq!(events, vec![ProcessEvent::Exited { code: Some(0) }]);

        assert!(!handle.kill().await);
        assert!(!handle.kill().await);
    }
}
