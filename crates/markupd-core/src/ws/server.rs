//! WebSocket Server implementation
//!
//! One endpoint: `ws://127.0.0.1:<port>/?token=<token>`.
//!
//! Every connection is both a client (submit / query) and an observer
//! (receives `task_update` broadcasts). Close codes:
//! - 4000: invalid URL
//! - 4001: missing or invalid token

use super::protocol::{parse_inbound, Inbound, Outbound, ProtocolError};
use crate::auth::{token_from_query, TokenValidator};
use crate::core::TaskOrchestrator;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Default listening port
pub const DEFAULT_WS_PORT: u16 = 9230;

/// Close code for a bad URL
pub const CLOSE_INVALID_URL: u16 = 4000;
/// Close code for a missing or rejected token
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Capacity of a connection's result queue
const REPLY_CHANNEL_CAPACITY: usize = 32;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket server options
pub struct WSServerOptions {
    /// Bind address, loopback by default
    pub host: String,
    /// Server port (0 picks a free one)
    pub port: u16,
    pub orchestrator: Arc<TaskOrchestrator>,
    pub validator: Arc<dyn TokenValidator>,
}

/// Task WebSocket Server
pub struct TaskWebSocketServer {
    host: String,
    port: u16,
    orchestrator: Arc<TaskOrchestrator>,
    validator: Arc<dyn TokenValidator>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into().into(),
    }
}

async fn send_json<S: Serialize>(ws_tx: &mut WsSink, msg: &S) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

/// Handshake details captured for routing and auth
#[derive(Debug, Default, Clone)]
struct HandshakeInfo {
    path: String,
    token: Option<String>,
}

impl TaskWebSocketServer {
    /// Create a new WebSocket server
    pub fn new(options: WSServerOptions) -> Self {
        Self {
            host: options.host,
            port: options.port,
            orchestrator: options.orchestrator,
            validator: options.validator,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Address the server is listening on, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start accepting connections in the background
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!(addr = %local_addr, "Task WebSocket server started");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let orchestrator = Arc::clone(&self.orchestrator);
        let validator = Arc::clone(&self.validator);

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let orchestrator = Arc::clone(&orchestrator);
                                let validator = Arc::clone(&validator);
                                let conn_shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, addr, orchestrator, validator, conn_shutdown).await {
                                        error!(error = %e, %addr, "WebSocket connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every open connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!("Task WebSocket server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        orchestrator: Arc<TaskOrchestrator>,
        validator: Arc<dyn TokenValidator>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        // Capture path and token from handshake
        let info_cell = Arc::new(StdMutex::new(HandshakeInfo::default()));
        let info_cell2 = Arc::clone(&info_cell);

        let ws_stream = accept_hdr_async(stream, move |req: &WsRequest, resp: WsResponse| {
            if let Ok(mut info) = info_cell2.lock() {
                info.path = req.uri().path().to_string();
                info.token = token_from_query(req.uri().query()).map(Cow::into_owned);
            }
            Ok(resp)
        })
        .await?;

        let handshake = info_cell.lock().map(|i| i.clone()).unwrap_or_default();

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        if handshake.path != "/" {
            let _ = ws_tx
                .send(Message::Close(Some(close_frame(
                    CLOSE_INVALID_URL,
                    "Invalid URL. Use /?token=<token>",
                ))))
                .await;
            warn!(%addr, path = %handshake.path, "Invalid WebSocket URL");
            return Ok(());
        }

        let authorized = handshake
            .token
            .as_deref()
            .map(|t| validator.validate(t))
            .unwrap_or(false);
        if !authorized {
            let _ = ws_tx
                .send(Message::Close(Some(close_frame(CLOSE_UNAUTHORIZED, "Unauthorized"))))
                .await;
            warn!(%addr, "Rejected connection with missing or invalid token");
            return Ok(());
        }

        let broadcaster = Arc::clone(orchestrator.broadcaster());
        let (observer_id, mut updates_rx) = broadcaster.register();
        let (reply_tx, mut reply_rx) = mpsc::channel::<Outbound>(REPLY_CHANNEL_CAPACITY);

        info!(%addr, observer_id, "Client connected");

        loop {
            tokio::select! {
                // broadcasts -> client
                frame = updates_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }

                // task results -> client
                Some(reply) = reply_rx.recv() => {
                    if send_json(&mut ws_tx, &reply).await.is_err() {
                        break;
                    }
                }

                // client -> server
                msg = ws_rx.next() => {
                    let reply = match msg {
                        Some(Ok(Message::Text(text))) => {
                            dispatch(&text, &orchestrator, &reply_tx).await
                        }
                        Some(Ok(Message::Binary(_))) => Outbound::from(&ProtocolError::Binary),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(%addr, error = %e, "WebSocket error");
                            break;
                        }
                        _ => continue,
                    };
                    if send_json(&mut ws_tx, &reply).await.is_err() {
                        break;
                    }
                }

                _ = shutdown_rx.recv() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(close_frame(1001, "Server shutting down"))))
                        .await;
                    break;
                }
            }
        }

        broadcaster.unregister(observer_id);
        info!(%addr, observer_id, "Client disconnected");
        Ok(())
    }
}

/// Handle one inbound text frame and produce the immediate reply.
///
/// For `submit_change` the terminal `task_result` is queued on `reply_tx`
/// once the task finishes.
pub async fn dispatch(
    text: &str,
    orchestrator: &Arc<TaskOrchestrator>,
    reply_tx: &mpsc::Sender<Outbound>,
) -> Outbound {
    let inbound = match parse_inbound(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(error = %e, "Rejected inbound message");
            return Outbound::from(&e);
        }
    };

    match inbound {
        Inbound::Ping => Outbound::Pong,
        Inbound::ListTasks => Outbound::TaskList {
            tasks: orchestrator.list_tasks().await,
        },
        Inbound::GetTaskOutput { task_id } => {
            let output = orchestrator.task_output(&task_id).await;
            Outbound::TaskOutput {
                task_id,
                found: output.is_some(),
                output,
            }
        }
        Inbound::SubmitChange(request) => match orchestrator.submit(request).await {
            Ok(submission) => {
                let task_id = submission.task_id;
                let reply_tx = reply_tx.clone();
                let outcome = submission.outcome;
                let forward_id = task_id.clone();
                tokio::spawn(async move {
                    match outcome.await {
                        Ok(outcome) => {
                            if reply_tx.send(Outbound::TaskResult(outcome)).await.is_err() {
                                debug!(task_id = %forward_id, "Requester gone, task result dropped");
                            }
                        }
                        Err(_) => debug!(task_id = %forward_id, "Task abandoned without a result"),
                    }
                });
                Outbound::started(task_id)
            }
            Err(e) => {
                warn!(error = %e, "Change request rejected");
                Outbound::error(e.code(), e.to_string())
            }
        },
    }
}
