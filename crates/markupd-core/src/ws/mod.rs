//! WebSocket transport
//!
//! Lets the markup UI (and any watcher) submit change requests, query tasks
//! and receive task updates as they happen.

mod protocol;
mod server;

pub use protocol::{parse_inbound, Inbound, Outbound, ProtocolError};
pub use server::{
    dispatch, TaskWebSocketServer, WSServerOptions, CLOSE_INVALID_URL, CLOSE_UNAUTHORIZED,
    DEFAULT_WS_PORT,
};
