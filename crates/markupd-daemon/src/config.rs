//! Daemon configuration, read from the environment

use markupd_core::ws::DEFAULT_WS_PORT;
use markupd_core::MAX_TASKS;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bind address. The daemon only ever listens on loopback.
pub const WS_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub tasks_path: PathBuf,
    pub logs_dir: PathBuf,
    pub ws_port: u16,
    /// Explicit token; otherwise one is provisioned under `home`
    pub token: Option<String>,
    pub agent_bin: PathBuf,
    pub max_tasks: usize,
    pub task_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let home = var("MARKUPD_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        let tasks_path = var("MARKUPD_TASKS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("tasks.json"));

        Self {
            logs_dir: home.join("logs"),
            tasks_path,
            ws_port: var("MARKUPD_WS_PORT")
                .and_then(|v| v.trim().parse::<u16>().ok())
                .unwrap_or(DEFAULT_WS_PORT),
            token: var("MARKUPD_TOKEN").map(|t| t.trim().to_string()),
            agent_bin: var("MARKUPD_AGENT_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("claude")),
            max_tasks: var("MARKUPD_MAX_TASKS")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(MAX_TASKS),
            task_timeout: var("MARKUPD_TASK_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs),
            home,
        }
    }

    pub fn token_path(&self) -> PathBuf {
        token_path(&self.home)
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".markupd"))
        .unwrap_or_else(|| PathBuf::from(".markupd"))
}

pub fn token_path(home: &Path) -> PathBuf {
    home.join("token")
}

/// Log filter: `RUST_LOG`, then `MARKUPD_LOG_LEVEL`, then `info`
pub fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("MARKUPD_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("MARKUPD_HOME", "/srv/markupd")]);
        assert_eq!(c.home, PathBuf::from("/srv/markupd"));
        assert_eq!(c.tasks_path, PathBuf::from("/srv/markupd/tasks.json"));
        assert_eq!(c.logs_dir, PathBuf::from("/srv/markupd/logs"));
        assert_eq!(c.token_path(), PathBuf::from("/srv/markupd/token"));
        assert_eq!(c.ws_port, 9230);
        assert_eq!(c.token, None);
        assert_eq!(c.agent_bin, PathBuf::from("claude"));
        assert_eq!(c.max_tasks, 100);
        assert_eq!(c.task_timeout, None);
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("MARKUPD_HOME", "/h"),
            ("MARKUPD_TASKS_PATH", "/data/tasks.json"),
            ("MARKUPD_WS_PORT", "9999"),
            ("MARKUPD_TOKEN", " abc "),
            ("MARKUPD_AGENT_BIN", "/usr/local/bin/agent"),
            ("MARKUPD_MAX_TASKS", "20"),
            ("MARKUPD_TASK_TIMEOUT_SECS", "600"),
        ]);
        assert_eq!(c.tasks_path, PathBuf::from("/data/tasks.json"));
        assert_eq!(c.ws_port, 9999);
        assert_eq!(c.token.as_deref(), Some("abc"));
        assert_eq!(c.agent_bin, PathBuf::from("/usr/local/bin/agent"));
        assert_eq!(c.max_tasks, 20);
        assert_eq!(c.task_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let c = config(&[
            ("MARKUPD_HOME", "/h"),
            ("MARKUPD_WS_PORT", "http"),
            ("MARKUPD_MAX_TASKS", "0"),
            ("MARKUPD_TASK_TIMEOUT_SECS", "-5"),
            ("MARKUPD_TOKEN", "   "),
        ]);
        assert_eq!(c.ws_port, 9230);
        assert_eq!(c.max_tasks, 100);
        assert_eq!(c.task_timeout, None);
        assert_eq!(c.token, None);
    }
}
