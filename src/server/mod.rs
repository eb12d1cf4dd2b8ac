//! Controller server: composition root and run loop.
//!
//! All components are constructed here at process start and passed
//! explicitly — no runtime lookup. The HTTP API and both WebSocket
//! endpoints share one axum router with `Extension`-injected state.

pub mod config;

pub use config::{load_controller_config, ControllerConfig};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Extension};
use ogent_core::{
    ai::{AiBackend, AiManager, AiPolicy, OpenAiBackend, RuleBasedBackend},
    messaging::{command_out_channel, MessageBus, RedisBus, PRESENCE_CHANNEL},
    protocol::{events, WireFrame},
    AgentRegistry, AuthService, CommandRegistry, EventBus, Router as CommandRouter, RouterConfig,
    SessionManager,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{api, websocket};

/// Build and run the controller until shutdown.
pub async fn run(config: ControllerConfig) -> Result<()> {
    let auth = Arc::new(AuthService::new(
        &config.auth.token_secret,
        config.auth.token_ttl_minutes,
        config.auth.admin_username.clone(),
        config.auth.admin_password.clone(),
    ));

    let agents = Arc::new(AgentRegistry::new());
    let commands = Arc::new(CommandRegistry::new(config.commands.retention));
    let sessions = Arc::new(SessionManager::new());

    let backend: Arc<dyn AiBackend> = match config.ai.backend_key.as_deref() {
        Some(key) if !key.is_empty() => {
            info!("AI stage using OpenAI-compatible backend");
            Arc::new(OpenAiBackend::new(key))
        }
        _ => {
            info!("AI stage using built-in rule-based analyzer");
            Arc::new(RuleBasedBackend::new())
        }
    };
    let ai = Arc::new(AiManager::new(
        Some(backend),
        AiPolicy {
            reject_unsafe: config.ai.reject_unsafe,
            mandatory: config.ai.mandatory,
        },
    ));

    let bus = EventBus::new(256);
    let router = Arc::new(CommandRouter::new(
        agents,
        commands,
        sessions,
        ai,
        bus.clone(),
        RouterConfig {
            command_deadline: config.commands.deadline(),
            grace_interval: config.commands.grace_interval(),
        },
    ));

    // Mirror command/presence events onto the shared messaging backend so
    // other replicas can pick them up.
    if let Some(url) = &config.messaging.url {
        match RedisBus::new(url) {
            Ok(redis_bus) => {
                info!("messaging backend connected, mirroring events");
                spawn_event_mirror(bus.clone(), Arc::new(redis_bus));
            }
            Err(e) => warn!(error = %e, "messaging backend unavailable, running single-replica"),
        }
    }

    let app = axum::Router::new()
        .merge(api::router())
        .route("/ws/agent", get(websocket::agent_handler))
        .route("/ws/gateway", get(websocket::requester_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(auth))
        .layer(Extension(router));

    let addr: SocketAddr = format!(
        "{}:{}",
        config.server.listen_host, config.server.listen_port
    )
    .parse()
    .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("controller listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("controller shutdown complete");
    Ok(())
}

/// Forward every bus event to its messaging channel. Best-effort: publish
/// failures are logged and dropped; Lost detection covers the gaps.
fn spawn_event_mirror(bus: EventBus, adapter: Arc<dyn MessageBus>) {
    tokio::spawn(async move {
        let mut rx = bus.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event mirror lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let WireFrame::Event { event: name, data } = &event.frame else {
                continue;
            };
            let channel = match name.as_str() {
                events::AGENT_CONNECTED | events::AGENT_DISCONNECTED => {
                    PRESENCE_CHANNEL.to_string()
                }
                _ => {
                    let command_id = data
                        .get("command_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok());
                    match command_id {
                        Some(id) => command_out_channel(id),
                        None => continue,
                    }
                }
            };

            if let Ok(payload) = serde_json::to_string(&event.frame) {
                if let Err(e) = adapter.publish(&channel, &payload).await {
                    warn!(channel = %channel, error = %e, "event mirror publish failed");
                }
            }
        }
    });
}

/// Shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("received terminate signal, shutting down");
        }
    }
}
