//! Types shared between the supervisor and its callers

use std::path::PathBuf;
use std::time::Duration;

/// Default capacity of the per-process event channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// How long output may keep arriving after the child has exited
pub const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What to launch and where
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Executable name or path
    pub program: PathBuf,
    /// Arguments, passed verbatim
    pub args: Vec<String>,
    /// Working directory of the child
    pub cwd: PathBuf,
    /// The complete child environment. Nothing else from the host leaks in.
    pub env: Vec<(String, String)>,
    /// Capacity of the bounded event channel
    pub channel_capacity: usize,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Which pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Event emitted by a supervised process
///
/// `Exited` is always the last event on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of output, newline included when the process wrote one
    Output { stream: OutputStream, chunk: String },
    /// Process terminated. `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture {0} of child process")]
    Pipe(&'static str),
}
