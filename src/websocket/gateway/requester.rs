//! Requester-side connection handler for `/ws/gateway`.
//!
//! A requester connects, submits commands, and receives the progress and
//! terminal events addressed to it. Events for commands submitted over
//! HTTP by the same user are forwarded to the connection as well.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use ogent_core::{
    protocol::{methods, ConnectAck, ConnectParams, WireError, WireErrorCode, WireFrame},
    AuthService, CommandEvent, ExecuteRequest, Router as CommandRouter, SessionKind,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    next_request, reject_and_close, send_frame, HEARTBEAT_TIMEOUT_SECS, PING_INTERVAL_SECS,
};

#[derive(Debug, Deserialize)]
struct GatewayExecuteParams {
    agent_id: String,
    #[serde(flatten)]
    request: ExecuteRequest,
}

#[derive(Debug, Deserialize)]
struct GatewayCancelParams {
    command_id: Uuid,
}

/// Main requester connection handler.
pub(crate) async fn handle_requester(
    socket: WebSocket,
    auth: Arc<AuthService>,
    router: Arc<CommandRouter>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Phase 1: `connect` handshake with timeout.
    let Some((request_id, method, params)) = next_request(&mut ws_rx).await else {
        reject_and_close(
            &mut ws_tx,
            WireFrame::err(
                "",
                WireError::new(WireErrorCode::NotRegistered, "Expected connect request"),
            ),
        )
        .await;
        return;
    };
    if method != methods::CONNECT {
        reject_and_close(
            &mut ws_tx,
            WireFrame::err(
                request_id,
                WireError::new(
                    WireErrorCode::NotRegistered,
                    format!("Must connect first, got method: {method}"),
                ),
            ),
        )
        .await;
        return;
    }
    let connect: ConnectParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            reject_and_close(
                &mut ws_tx,
                WireFrame::err(
                    request_id,
                    WireError::new(
                        WireErrorCode::InvalidParams,
                        format!("Invalid connect params: {e}"),
                    ),
                ),
            )
            .await;
            return;
        }
    };
    let ctx = match auth.validate_token(&connect.token) {
        Ok(ctx) => ctx,
        Err(_) => {
            reject_and_close(
                &mut ws_tx,
                WireFrame::err(
                    request_id,
                    WireError::new(WireErrorCode::Unauthorized, "Invalid or expired token"),
                ),
            )
            .await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let requester_sid = session_id.to_string();
    let mut out_rx = router
        .sessions()
        .register(session_id, SessionKind::Requester, &ctx.user_id);

    let ack = ConnectAck {
        session_id,
        user_id: ctx.user_id.clone(),
    };
    let ack_frame = WireFrame::ok(request_id, serde_json::to_value(ack).unwrap_or_default());
    if !send_frame(&mut ws_tx, &ack_frame).await {
        router.sessions().close(session_id);
        return;
    }
    info!(session_id = %session_id, user = %ctx.user_id, "requester connected");

    // Phase 2: message loop with command-event forwarding.
    let mut bus_rx = router.bus().subscribe();
    let ping_interval =
        tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_SECS));
    tokio::pin!(ping_interval);
    let mut last_recv = tokio::time::Instant::now();
    let heartbeat_timeout = tokio::time::Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        last_recv = tokio::time::Instant::now();
                        if let Some(response) =
                            handle_requester_frame(&text, &requester_sid, &router).await
                        {
                            if !send_frame(&mut ws_tx, &response).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_recv = tokio::time::Instant::now();
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_recv = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "requester WS error");
                        break;
                    }
                    _ => {}
                }
            }
            // Command events addressed to this requester (or to everyone)
            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        if event_is_for(&event, &requester_sid, &ctx.user_id) {
                            if !send_frame(&mut ws_tx, &event.frame).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(session_id = %session_id, lagged = n, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if !send_frame(&mut ws_tx, &frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if last_recv.elapsed() > heartbeat_timeout {
                    info!(session_id = %session_id, "heartbeat timeout, closing");
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    router.sessions().close(session_id);
    info!(session_id = %session_id, user = %ctx.user_id, "requester connection closed");
}

fn event_is_for(event: &CommandEvent, requester_sid: &str, user_id: &str) -> bool {
    match &event.requester_id {
        // Presence changes go to every requester connection.
        None => true,
        Some(target) => target == requester_sid || target == user_id,
    }
}

/// Handle one requester frame. Returns a response frame if applicable.
async fn handle_requester_frame(
    text: &str,
    requester_sid: &str,
    router: &CommandRouter,
) -> Option<WireFrame> {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(WireFrame::err(
                "",
                WireError::new(WireErrorCode::InvalidParams, format!("Invalid frame: {e}")),
            ));
        }
    };

    let (id, method, params) = match frame {
        WireFrame::Request { id, method, params } => (id, method, params),
        // Requesters should not send Event or Response frames.
        _ => return None,
    };

    match method.as_str() {
        methods::PING => Some(WireFrame::ok(id, serde_json::json!({"pong": true}))),
        methods::COMMAND_EXECUTE => Some(execute(id, params, requester_sid, router).await),
        methods::COMMAND_CANCEL => Some(cancel(id, params, router)),
        other => Some(WireFrame::err(
            id,
            WireError::new(
                WireErrorCode::UnknownMethod,
                format!("Unknown method: {other}"),
            ),
        )),
    }
}

async fn execute(
    id: String,
    params: Value,
    requester_sid: &str,
    router: &CommandRouter,
) -> WireFrame {
    let params: GatewayExecuteParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            return WireFrame::err(
                id,
                WireError::new(
                    WireErrorCode::InvalidParams,
                    format!("Invalid execute params: {e}"),
                ),
            );
        }
    };

    match router
        .execute(requester_sid, &params.agent_id, params.request)
        .await
    {
        Ok(record) => WireFrame::ok(
            id,
            serde_json::json!({
                "command_id": record.command_id,
                "agent_id": record.agent_id,
                "status": record.status,
                "timestamp": record.created_at,
            }),
        ),
        Err(e) => WireFrame::err(
            id,
            WireError::new(WireErrorCode::InternalError, e.to_string()),
        ),
    }
}

fn cancel(id: String, params: Value, router: &CommandRouter) -> WireFrame {
    let params: GatewayCancelParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            return WireFrame::err(
                id,
                WireError::new(
                    WireErrorCode::InvalidParams,
                    format!("Invalid cancel params: {e}"),
                ),
            );
        }
    };

    match router.cancel(params.command_id) {
        Ok(()) => WireFrame::ok(id, serde_json::json!({"status": "cancel_requested"})),
        Err(ogent_core::Error::CommandNotFound(_)) => WireFrame::err(
            id,
            WireError::new(WireErrorCode::NotFound, "Unknown command"),
        ),
        Err(ogent_core::Error::NotDeliverable(msg)) | Err(ogent_core::Error::AgentNotFound(msg)) => {
            WireFrame::err(id, WireError::new(WireErrorCode::NotDeliverable, msg))
        }
        Err(e) => WireFrame::err(
            id,
            WireError::new(WireErrorCode::InternalError, e.to_string()),
        ),
    }
}
