//! HTTP API surface of the controller.
//!
//! Bootstrap auth (`/token`), agent and command state queries, command
//! dispatch, and liveness. The WebSocket endpoints live in
//! `crate::websocket`.

mod agents;
mod commands;
mod health;
mod token;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

/// Build the HTTP API router. State is injected as Extension layers by the
/// server composition root.
pub fn router() -> Router {
    Router::new()
        .route("/token", post(token::issue_token))
        .route("/health", get(health::health))
        .route("/agents", get(agents::list_agents))
        .route("/agents/:agent_id", get(agents::get_agent))
        .route("/agents/:agent_id/execute", post(agents::execute_command))
        .route("/agents/:agent_id/analyze", post(agents::analyze_command))
        .route("/commands", get(commands::list_commands))
        .route("/commands/:command_id", get(commands::get_command))
        .route("/commands/:command_id/cancel", post(commands::cancel_command))
}

/// JSON error envelope shared by all handlers.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub success: bool,
    pub error: String,
}

pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<ogent_core::Error> for ApiError {
    fn from(err: ogent_core::Error) -> Self {
        use ogent_core::Error;
        let status = match &err {
            Error::AgentNotFound(_) | Error::CommandNotFound(_) => StatusCode::NOT_FOUND,
            Error::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            Error::NotDeliverable(_) => StatusCode::CONFLICT,
            Error::AiBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}
