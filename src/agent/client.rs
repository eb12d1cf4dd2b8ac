//! Agent core: authenticate, connect, register, and pump frames.
//!
//! The client exchanges credentials for a bearer token, opens the event
//! protocol channel, registers, then bridges frames between the controller
//! and the worker pool. On disconnect it reconnects with bounded
//! exponential backoff; progress and results produced while offline are
//! buffered and flushed on the next session, so a command that survives a
//! reconnect still reports its original `command_id`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use ogent_core::{
    protocol::{
        events, methods, AgentInfo, CancelCommand, ExecuteCommand, RegisterAck, RegisterParams,
        WireFrame,
    },
    retry::Backoff,
};
use ogent_exec::{CommandExecutor, LocalExecutor, RemoteExecutor};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::config::AgentConfig;
use super::worker::{spawn_workers, CommandJob, Executors};

/// Run the agent until it is stopped or reconnecting is exhausted.
pub async fn run_agent(config: AgentConfig) -> Result<()> {
    let local = Arc::new(LocalExecutor::new());
    let remote = build_remote(&config).await;
    let info = build_info(&local, remote.as_deref());
    let executors = Arc::new(Executors {
        local,
        remote,
    });

    let (job_tx, job_rx) = mpsc::channel::<CommandJob>(64);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
    let cancels: Arc<DashMap<Uuid, CancellationToken>> = Arc::new(DashMap::new());
    spawn_workers(
        config.concurrency_limit,
        executors,
        Arc::new(Mutex::new(job_rx)),
        out_tx,
        Arc::clone(&cancels),
    );

    let backoff = Backoff::new(config.reconnect_delay());
    let mut failures: u32 = 0;
    loop {
        match run_session(&config, &info, &job_tx, &mut out_rx, &cancels).await {
            Ok(()) => {
                failures = 0;
                info!("disconnected from controller, reconnecting");
            }
            Err(e) => {
                failures += 1;
                warn!(attempt = failures, error = %e, "connection attempt failed");
                if config.max_reconnect_attempts > 0 && failures >= config.max_reconnect_attempts {
                    bail!(
                        "giving up after {failures} failed connection attempts to {}",
                        config.controller_url
                    );
                }
            }
        }
        let delay = backoff.delay_for(failures.max(1));
        debug!(delay_ms = delay.as_millis() as u64, "sleeping before reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn build_remote(config: &AgentConfig) -> Option<Arc<RemoteExecutor>> {
    if !config.remote.enabled {
        return None;
    }
    let executor = RemoteExecutor::new(config.remote_shell_config());
    if !executor.available() {
        return None;
    }
    // Probe at startup; a failed probe keeps the executor configured, the
    // target may come back.
    match executor.test_connection().await {
        Ok(()) => info!(target = %executor.target(), "remote shell target reachable"),
        Err(e) => warn!(target = %executor.target(), error = %e, "remote shell probe failed"),
    }
    Some(Arc::new(executor))
}

fn build_info(local: &LocalExecutor, remote: Option<&RemoteExecutor>) -> AgentInfo {
    let mut executors = vec!["local".to_string()];
    let mut remote_enabled = false;
    let mut remote_target = None;
    if let Some(remote) = remote {
        executors.push("remote".to_string());
        remote_enabled = true;
        remote_target = Some(remote.target());
    }
    AgentInfo {
        hostname: Some(local.target()),
        platform: Some(std::env::consts::OS.to_string()),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        executors,
        remote_enabled,
        remote_target,
    }
}

/// One connected session: register, then pump frames until disconnect.
/// `Ok(())` is a clean disconnect (reconnect without counting a failure);
/// `Err` is a failed attempt.
async fn run_session(
    config: &AgentConfig,
    info: &AgentInfo,
    job_tx: &mpsc::Sender<CommandJob>,
    out_rx: &mut mpsc::UnboundedReceiver<WireFrame>,
    cancels: &Arc<DashMap<Uuid, CancellationToken>>,
) -> Result<()> {
    let token = fetch_token(config).await?;
    let ws_url = websocket_url(&config.controller_url)?;
    info!(url = %ws_url, "connecting to controller");
    let (stream, _) = connect_async(ws_url.as_str())
        .await
        .context("websocket connect failed")?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    // Register handshake.
    let register = RegisterParams {
        token,
        agent_id: config.agent_id_override.clone(),
        info: info.clone(),
    };
    let frame = WireFrame::Request {
        id: Uuid::new_v4().to_string(),
        method: methods::REGISTER.to_string(),
        params: serde_json::to_value(register)?,
    };
    ws_tx
        .send(WsMessage::Text(serde_json::to_string(&frame)?))
        .await
        .context("failed to send register request")?;

    let ack = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(message) = ws_rx.next().await {
            let text = match message {
                Ok(WsMessage::Text(text)) => text,
                Ok(_) => continue,
                Err(e) => bail!("connection error during registration: {e}"),
            };
            if let Ok(WireFrame::Response { result, error, .. }) = serde_json::from_str(&text) {
                if let Some(error) = error {
                    bail!("registration rejected: {}", error.message);
                }
                if let Some(result) = result {
                    let ack: RegisterAck = serde_json::from_value(result)
                        .context("malformed register_ack")?;
                    return Ok(ack);
                }
            }
        }
        bail!("connection closed during registration")
    })
    .await
    .context("timed out waiting for register_ack")??;

    info!(
        agent_id = %ack.assigned_agent_id,
        session_id = %ack.session_id,
        "registered with controller"
    );

    // Main pump: controller frames in, worker frames out.
    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_controller_frame(&text, job_tx, cancels).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_tx.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error, dropping connection");
                        return Ok(());
                    }
                    _ => {}
                }
            }
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let json = serde_json::to_string(&frame)?;
                        if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                            // Frame handoff failed mid-send; the controller's
                            // grace/Lost handling covers the gap.
                            return Ok(());
                        }
                    }
                    None => bail!("worker pool channel closed"),
                }
            }
        }
    }
}

/// Dispatch one controller-origin frame.
async fn handle_controller_frame(
    text: &str,
    job_tx: &mpsc::Sender<CommandJob>,
    cancels: &Arc<DashMap<Uuid, CancellationToken>>,
) {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unparseable frame from controller, dropping");
            return;
        }
    };

    let (event, data) = match frame {
        WireFrame::Event { event, data } => (event, data),
        // Responses (pongs etc.) need no handling here.
        _ => return,
    };

    match event.as_str() {
        events::EXECUTE_COMMAND => {
            let execute: ExecuteCommand = match serde_json::from_value(data) {
                Ok(execute) => execute,
                Err(e) => {
                    warn!(error = %e, "malformed execute_command, dropping");
                    return;
                }
            };
            info!(
                command_id = %execute.command_id,
                target = %execute.execution_target,
                "command received"
            );
            let cancel = CancellationToken::new();
            cancels.insert(execute.command_id, cancel.clone());
            let job = CommandJob {
                command_id: execute.command_id,
                command: execute.command,
                execution_target: execute.execution_target,
                cancel,
            };
            if job_tx.send(job).await.is_err() {
                warn!("worker pool is gone, dropping command");
            }
        }
        events::CANCEL_COMMAND => {
            let cancel: CancelCommand = match serde_json::from_value(data) {
                Ok(cancel) => cancel,
                Err(e) => {
                    warn!(error = %e, "malformed cancel_command, dropping");
                    return;
                }
            };
            match cancels.get(&cancel.command_id) {
                Some(token) => {
                    info!(command_id = %cancel.command_id, "cancellation requested");
                    token.cancel();
                }
                None => debug!(command_id = %cancel.command_id, "cancel for unknown command"),
            }
        }
        other => debug!(event = %other, "ignoring event from controller"),
    }
}

async fn fetch_token(config: &AgentConfig) -> Result<String> {
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }

    let base = config.controller_url.trim_end_matches('/');
    let response = reqwest::Client::new()
        .post(format!("{base}/token"))
        .form(&[
            ("username", config.username.as_str()),
            ("password", config.password.as_str()),
        ])
        .send()
        .await
        .context("token request failed")?;

    if !response.status().is_success() {
        bail!("authentication failed: {}", response.status());
    }
    let token: TokenResponse = response
        .json()
        .await
        .context("malformed token response")?;
    Ok(token.access_token)
}

fn websocket_url(controller_url: &str) -> Result<Url> {
    let mut url = Url::parse(controller_url).context("invalid controller_url")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported controller_url scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("failed to set websocket scheme"))?;
    url.set_path("/ws/agent");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ogent_exec::ExecutionTarget;

    #[test]
    fn test_websocket_url_schemes() {
        assert_eq!(
            websocket_url("http://127.0.0.1:8000").unwrap().as_str(),
            "ws://127.0.0.1:8000/ws/agent"
        );
        assert_eq!(
            websocket_url("https://ogent.example.com").unwrap().as_str(),
            "wss://ogent.example.com/ws/agent"
        );
        assert!(websocket_url("ftp://nope").is_err());
    }

    #[tokio::test]
    async fn test_execute_command_frame_enqueues_job() {
        let (job_tx, mut job_rx) = mpsc::channel(4);
        let cancels: Arc<DashMap<Uuid, CancellationToken>> = Arc::new(DashMap::new());

        let command_id = Uuid::new_v4();
        let frame = WireFrame::event(
            events::EXECUTE_COMMAND,
            serde_json::to_value(ExecuteCommand {
                command_id,
                command: "echo hi".to_string(),
                execution_target: ExecutionTarget::Local,
                requester_sid: "sid-1".to_string(),
            })
            .unwrap(),
        );
        let text = serde_json::to_string(&frame).unwrap();

        handle_controller_frame(&text, &job_tx, &cancels).await;

        let job = job_rx.recv().await.unwrap();
        assert_eq!(job.command_id, command_id);
        assert_eq!(job.command, "echo hi");
        assert!(cancels.contains_key(&command_id));
    }

    #[tokio::test]
    async fn test_cancel_command_frame_cancels_token() {
        let (job_tx, _job_rx) = mpsc::channel(4);
        let cancels: Arc<DashMap<Uuid, CancellationToken>> = Arc::new(DashMap::new());
        let command_id = Uuid::new_v4();
        let token = CancellationToken::new();
        cancels.insert(command_id, token.clone());

        let frame = WireFrame::event(
            events::CANCEL_COMMAND,
            serde_json::to_value(CancelCommand { command_id }).unwrap(),
        );
        let text = serde_json::to_string(&frame).unwrap();
        handle_controller_frame(&text, &job_tx, &cancels).await;

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (job_tx, mut job_rx) = mpsc::channel(4);
        let cancels: Arc<DashMap<Uuid, CancellationToken>> = Arc::new(DashMap::new());

        handle_controller_frame("not json", &job_tx, &cancels).await;
        handle_controller_frame(
            r#"{"frame":"event","event":"execute_command","data":{"bogus":true}}"#,
            &job_tx,
            &cancels,
        )
        .await;

        assert!(job_rx.try_recv().is_err());
        assert!(cancels.is_empty());
    }

    #[test]
    fn test_build_info_reports_executors() {
        let local = LocalExecutor::new();
        let info = build_info(&local, None);
        assert_eq!(info.executors, vec!["local".to_string()]);
        assert!(!info.remote_enabled);
        assert!(info.hostname.is_some());
        assert_eq!(info.platform.as_deref(), Some(std::env::consts::OS));
    }
}
