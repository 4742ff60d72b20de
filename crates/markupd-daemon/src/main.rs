//! markupd daemon
//!
//! Accepts change requests from the markup UI over a loopback WebSocket,
//! runs the coding agent for each one and streams progress back.

mod config;
mod token;

use anyhow::{Context, Result};
use config::{log_filter, Config, WS_HOST};
use markupd_core::{
    AgentCommand, Broadcaster, OrchestratorOptions, SharedToken, TaskOrchestrator,
    TaskWebSocketServer, WSServerOptions,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    std::fs::create_dir_all(&config.home).ok();

    // Dual-layer logging: stderr + file (daily rotation)
    std::fs::create_dir_all(&config.logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&config.logs_dir, "markupd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // Panic hook: make sure panics land in the log file too
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let token = match config.token.clone() {
        Some(token) => token,
        None => token::load_or_create(&config.token_path())?,
    };

    let orchestrator = Arc::new(
        TaskOrchestrator::new(
            OrchestratorOptions {
                tasks_path: Some(config.tasks_path.clone()),
                max_tasks: config.max_tasks,
                agent: AgentCommand {
                    program: config.agent_bin.clone(),
                    ..Default::default()
                },
                logs_dir: Some(config.logs_dir.clone()),
                task_timeout: config.task_timeout,
                ..Default::default()
            },
            Arc::new(Broadcaster::new()),
        )
        .await,
    );

    let recovered = orchestrator.recovered_in_flight();
    if !recovered.is_empty() {
        warn!(
            count = recovered.len(),
            "Tasks from the previous run never finished; they are kept as processing"
        );
    }

    let mut ws_server = TaskWebSocketServer::new(WSServerOptions {
        host: WS_HOST.to_string(),
        port: config.ws_port,
        orchestrator: Arc::clone(&orchestrator),
        validator: Arc::new(SharedToken::new(&token)),
    });
    let addr = ws_server
        .start()
        .await
        .with_context(|| format!("Failed to start WebSocket server on port {}", config.ws_port))?;

    info!(
        %addr,
        home = %config.home.display(),
        agent = %config.agent_bin.display(),
        "markupd ready"
    );

    wait_for_shutdown().await?;

    info!("Shutting down");
    ws_server.stop().await;
    orchestrator.shutdown().await;
    info!("markupd stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
