//! Gateway WebSocket handlers.
//!
//! Two authenticated endpoints share the same frame protocol:
//!
//! - `/ws/agent` — agents: `register` handshake, then `execute_command` /
//!   `cancel_command` inbound and `command_progress` / `command_result` /
//!   `agent_info` outbound (from the agent's point of view).
//! - `/ws/gateway` — requesters: `connect` handshake, `command.execute` /
//!   `command.cancel` requests, and streamed command events.
//!
//! Flow per connection:
//! 1. Peer sends the handshake Request with a bearer token
//! 2. Server validates the token and binds a session
//! 3. Frames flow both ways; server pings keep the connection honest

mod agent;
mod requester;

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    Extension,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use ogent_core::{protocol::WireFrame, AuthService, Router as CommandRouter};
use serde_json::Value;

/// Max time without receiving a message before considering the connection dead.
pub(crate) const HEARTBEAT_TIMEOUT_SECS: u64 = 60;
/// How often to send server-side pings.
pub(crate) const PING_INTERVAL_SECS: u64 = 30;
/// Handshake must complete within this window.
pub(crate) const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Maximum size of a single WS text message (1 MB).
pub(crate) const MAX_MESSAGE_BYTES: usize = 1_048_576;
/// Malformed frames tolerated before the session is disconnected.
pub(crate) const MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// WebSocket upgrade handler for `/ws/agent`.
pub async fn agent_handler(
    ws: WebSocketUpgrade,
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(router): Extension<Arc<CommandRouter>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| agent::handle_agent(socket, auth, router))
}

/// WebSocket upgrade handler for `/ws/gateway`.
pub async fn requester_handler(
    ws: WebSocketUpgrade,
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(router): Extension<Arc<CommandRouter>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| requester::handle_requester(socket, auth, router))
}

pub(crate) type WsSink = SplitSink<WebSocket, Message>;

/// Serialize and send a frame; returns false when the socket is gone.
pub(crate) async fn send_frame(tx: &mut WsSink, frame: &WireFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => tx.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}

/// Send an error response and close the socket. Used for handshake
/// failures.
pub(crate) async fn reject_and_close(tx: &mut WsSink, frame: WireFrame) {
    let _ = send_frame(tx, &frame).await;
    let _ = tx.send(Message::Close(None)).await;
}

/// Wait for the first Request frame of a connection (the handshake).
pub(crate) async fn next_request(
    rx: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<(String, String, Value)> {
    let timeout = tokio::time::Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
    let message = tokio::time::timeout(timeout, rx.next()).await.ok()??;
    let text = match message {
        Ok(Message::Text(text)) => text,
        _ => return None,
    };
    match serde_json::from_str::<WireFrame>(&text) {
        Ok(WireFrame::Request { id, method, params }) => Some((id, method, params)),
        _ => None,
    }
}
