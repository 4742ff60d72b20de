//! markupd-watch - follow markupd tasks from a terminal
//!
//! Usage:
//!   markupd-watch                  # list tasks, then stream updates
//!   markupd-watch --task <id>      # print one task's output and exit
//!   markupd-watch --port 9230 --token <token>

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use markupd_core::{Inbound, Outbound, Task, TaskStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9230;
const UNAUTHORIZED: u16 = 4001;

#[derive(Parser, Debug)]
#[command(name = "markupd-watch")]
#[command(about = "Follow markupd tasks")]
#[command(version)]
struct Args {
    /// Print the output of this task and exit
    #[arg(short, long)]
    task: Option<String>,

    /// WebSocket server host
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// WebSocket server port
    #[arg(short, long, env = "MARKUPD_WS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Pairing token (defaults to the daemon's token file)
    #[arg(long, env = "MARKUPD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// List tasks and exit instead of following updates
    #[arg(long)]
    once: bool,
}

/// What has already been printed for a task
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Seen {
    status: Option<TaskStatus>,
    output_len: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let token = match args.token.clone() {
        Some(token) => token,
        None => read_token_file()?,
    };

    let url = format!(
        "ws://{}:{}/?token={}",
        args.host,
        args.port,
        urlencoding::encode(&token)
    );
    let (ws_stream, _) = connect_async(&url)
        .await
        .with_context(|| format!("Failed to connect to markupd at {}:{}", args.host, args.port))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let first = match &args.task {
        Some(task_id) => Inbound::GetTaskOutput {
            task_id: task_id.clone(),
        },
        None => Inbound::ListTasks,
    };
    ws_tx
        .send(WsMessage::Text(serde_json::to_string(&first)?))
        .await?;

    let mut seen: HashMap<String, Seen> = HashMap::new();

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = tokio::signal::ctrl_c() => break,
        };

        let text = match msg {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(frame))) => {
                if let Some(frame) = frame {
                    if u16::from(frame.code) == UNAUTHORIZED {
                        bail!("Rejected by markupd: invalid token");
                    }
                    eprintln!("Connection closed: {}", frame.reason);
                }
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("WebSocket error"),
            None => break,
        };

        let outbound: Outbound = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(_) => continue,
        };

        match outbound {
            Outbound::TaskOutput { task_id, found, output } => {
                if !found {
                    bail!("Task not found: {}", task_id);
                }
                print!("{}", output.unwrap_or_default());
                break;
            }
            Outbound::TaskList { tasks } => {
                if tasks.is_empty() {
                    println!("No tasks");
                }
                for task in tasks.iter().rev() {
                    println!("{}", format_task_line(task));
                    seen.insert(
                        task.id.clone(),
                        Seen {
                            status: Some(task.status),
                            output_len: task.output.len(),
                        },
                    );
                }
                if args.once {
                    break;
                }
                eprintln!("-- following updates, Ctrl+C to stop --");
            }
            Outbound::TaskUpdate { task } => {
                let entry = seen.entry(task.id.clone()).or_default();
                for line in new_output(&task.output, entry.output_len).lines() {
                    println!("  {} | {}", short_id(&task.id), line);
                }
                entry.output_len = task.output.len();
                if entry.status != Some(task.status) {
                    println!("{}", format_task_line(&task));
                    entry.status = Some(task.status);
                }
            }
            Outbound::Error { code, message } => {
                eprintln!("error [{}]: {}", code, message);
            }
            _ => {}
        }
    }

    Ok(())
}

fn read_token_file() -> Result<String> {
    let home = std::env::var("MARKUPD_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".markupd")))
        .context("Cannot locate the markupd home directory; pass --token")?;
    let path = home.join("token");
    let token = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read token from {}; pass --token", path.display()))?;
    Ok(token.trim().to_string())
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn format_task_line(task: &Task) -> String {
    let mut line = format!(
        "{} {:<8} {:<10} {}",
        task.started_at.with_timezone(&chrono::Local).format("%H:%M:%S"),
        short_id(&task.id),
        task.status,
        task.feedback_text.lines().next().unwrap_or_default()
    );
    if let Some(code) = task.exit_code {
        line.push_str(&format!(" (exit {})", code));
    }
    if let Some(hash) = &task.commit_hash {
        line.push_str(&format!(" [{}]", &hash[..hash.len().min(7)]));
    }
    if let Some(url) = &task.commit_url {
        line.push_str(&format!(" {}", url));
    }
    line
}

/// Output appended since `seen_len` bytes were printed
fn new_output(output: &str, seen_len: usize) -> &str {
    output.get(seen_len..).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_new_output() {
        assert_eq!(new_output("one\ntwo\n", 4), "two\n");
        assert_eq!(new_output("one\n", 4), "");
        // registry restarted with shorter output
        assert_eq!(new_output("x", 10), "");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["markupd-watch", "--task", "abc", "--port", "9000", "--token", "t"]);
        assert_eq!(args.task.as_deref(), Some("abc"));
        assert_eq!(args.port, 9000);
        assert_eq!(args.host, DEFAULT_HOST);
        assert!(!args.once);
    }

    #[test]
    fn test_format_task_line() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "0123456789",
            "feedbackText": "Make it pop\nplease",
            "element": { "tagName": "div" },
            "elementKey": "abcdabcdabcdabcd",
            "projectPath": "/p",
            "status": "complete",
            "startedAt": "2026-01-01T10:00:00Z",
            "completedAt": "2026-01-01T10:01:00Z",
            "output": "",
            "exitCode": 0,
            "commitHash": "1234567890abcdef1234567890abcdef12345678"
        }))
        .unwrap();

        let line = format_task_line(&task);
        assert!(line.contains("01234567"));
        assert!(line.contains("complete"));
        assert!(line.contains("Make it pop"));
        assert!(!line.contains("please"));
        assert!(line.contains("(exit 0)"));
        assert!(line.contains("[1234567]"));
    }
}
