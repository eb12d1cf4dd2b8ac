//! Agent-side connection handler for `/ws/agent`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use ogent_core::{
    protocol::{
        events, methods, AgentInfoUpdate, CommandProgress, CommandResult, RegisterAck,
        RegisterParams, WireError, WireErrorCode, WireFrame,
    },
    AuthService, Router as CommandRouter, SessionKind,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    next_request, reject_and_close, send_frame, HEARTBEAT_TIMEOUT_SECS, MAX_PROTOCOL_VIOLATIONS,
    PING_INTERVAL_SECS,
};

/// Main agent connection handler.
pub(crate) async fn handle_agent(
    socket: WebSocket,
    auth: Arc<AuthService>,
    router: Arc<CommandRouter>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Phase 1: `register` handshake with timeout.
    let Some((request_id, method, params)) = next_request(&mut ws_rx).await else {
        reject_and_close(
            &mut ws_tx,
            WireFrame::err(
                "",
                WireError::new(WireErrorCode::NotRegistered, "Expected register request"),
            ),
        )
        .await;
        return;
    };
    if method != methods::REGISTER {
        reject_and_close(
            &mut ws_tx,
            WireFrame::err(
                request_id,
                WireError::new(
                    WireErrorCode::NotRegistered,
                    format!("Must register first, got method: {method}"),
                ),
            ),
        )
        .await;
        return;
    }
    let register: RegisterParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            reject_and_close(
                &mut ws_tx,
                WireFrame::err(
                    request_id,
                    WireError::new(
                        WireErrorCode::InvalidParams,
                        format!("Invalid register params: {e}"),
                    ),
                ),
            )
            .await;
            return;
        }
    };
    let ctx = match auth.validate_token(&register.token) {
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

    // Bind the session before acking so register_ack precedes any
    // execute_command for this session.
    let session_id = Uuid::new_v4();
    let mut out_rx = router
        .sessions()
        .register(session_id, SessionKind::Agent, &ctx.user_id);
    let record = router.register_agent(session_id, register.agent_id, register.info);

    let ack = RegisterAck {
        assigned_agent_id: record.agent_id.clone(),
        session_id,
        status: "registered".to_string(),
    };
    let ack_frame = WireFrame::ok(request_id, serde_json::to_value(ack).unwrap_or_default());
    if !send_frame(&mut ws_tx, &ack_frame).await {
        router.handle_session_closed(session_id);
        return;
    }
    info!(agent_id = %record.agent_id, session_id = %session_id, user = %ctx.user_id, "agent connected");

    // Phase 2: event loop.
    let ping_interval =
        tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_SECS));
    tokio::pin!(ping_interval);
    let mut last_recv = tokio::time::Instant::now();
    let heartbeat_timeout = tokio::time::Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);
    let mut violations: u32 = 0;

    loop {
        tokio::select! {
            // Agent frames
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        last_recv = tokio::time::Instant::now();
                        if let Some(response) =
                            handle_agent_frame(&text, session_id, &router, &mut violations)
                        {
                            if !send_frame(&mut ws_tx, &response).await {
                                break;
                            }
                        }
                        if violations >= MAX_PROTOCOL_VIOLATIONS {
                            warn!(session_id = %session_id, "too many protocol violations, disconnecting");
                            break;
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
                        warn!(session_id = %session_id, error = %e, "agent WS error");
                        break;
                    }
                    _ => {}
                }
            }
            // Router → agent frames (execute_command, cancel_command)
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if !send_frame(&mut ws_tx, &frame).await {
                            break;
                        }
                    }
                    // Session evicted by a newer registration.
                    None => {
                        debug!(session_id = %session_id, "session handle closed, dropping connection");
                        break;
                    }
                }
            }
            // Server ping + heartbeat
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

    router.handle_session_closed(session_id);
    info!(agent_id = %record.agent_id, session_id = %session_id, "agent connection closed");
}

/// Dispatch one agent-origin frame. Returns an optional response frame.
fn handle_agent_frame(
    text: &str,
    session_id: Uuid,
    router: &CommandRouter,
    violations: &mut u32,
) -> Option<WireFrame> {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            *violations += 1;
            warn!(session_id = %session_id, error = %e, "unparseable frame, dropping");
            return None;
        }
    };

    match frame {
        WireFrame::Event { event, data } => {
            match event.as_str() {
                events::COMMAND_PROGRESS => match parse::<CommandProgress>(data) {
                    Some(progress) => router.handle_progress(session_id, progress),
                    None => *violations += 1,
                },
                events::COMMAND_RESULT => match parse::<CommandResult>(data) {
                    Some(result) => router.handle_result(session_id, result),
                    None => *violations += 1,
                },
                events::AGENT_INFO => match parse::<AgentInfoUpdate>(data) {
                    Some(update) => router.handle_agent_info(session_id, update.info),
                    None => *violations += 1,
                },
                other => {
                    *violations += 1;
                    warn!(session_id = %session_id, event = %other, "unknown event, dropping");
                }
            }
            None
        }
        WireFrame::Request { id, method, .. } if method == methods::PING => {
            Some(WireFrame::ok(id, serde_json::json!({"pong": true})))
        }
        WireFrame::Request { id, method, .. } => {
            *violations += 1;
            Some(WireFrame::err(
                id,
                WireError::new(
                    WireErrorCode::UnknownMethod,
                    format!("Unknown method: {method}"),
                ),
            ))
        }
        // Agents have no business sending Response frames mid-stream.
        WireFrame::Response { .. } => {
            *violations += 1;
            None
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: Value) -> Option<T> {
    serde_json::from_value(data).ok()
}
