//! Command record queries and operator cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    Extension, Json,
};
use ogent_core::{CommandRecord, Router as CommandRouter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiError;
use crate::middleware::auth::RequireAuth;

#[derive(Debug, Deserialize)]
pub struct ListCommandsQuery {
    pub agent_id: Option<String>,
    pub requester_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct CommandListResponse {
    pub commands: Vec<CommandRecord>,
    pub count: usize,
}

/// `GET /commands?agent_id=&requester_id=&limit=`
///
/// Filtered by agent or requester; with neither filter, the caller's own
/// commands are returned.
pub async fn list_commands(
    RequireAuth(auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
    Query(query): Query<ListCommandsQuery>,
) -> Json<CommandListResponse> {
    let commands = if let Some(agent_id) = &query.agent_id {
        router.commands().list_by_agent(agent_id, query.limit)
    } else {
        let requester = query.requester_id.as_deref().unwrap_or(&auth.user_id);
        router.commands().list_by_requester(requester, query.limit)
    };
    let count = commands.len();
    Json(CommandListResponse { commands, count })
}

/// `GET /commands/{command_id}`
pub async fn get_command(
    RequireAuth(_auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
    Path(command_id): Path<Uuid>,
) -> Result<Json<CommandRecord>, ApiError> {
    let record = router.commands().get(command_id)?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub command_id: Uuid,
    pub status: &'static str,
}

/// `POST /commands/{command_id}/cancel` — operator cancellation. The
/// terminal outcome still arrives through the normal paths (cancelled
/// result, or lost on deadline).
pub async fn cancel_command(
    RequireAuth(_auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
    Path(command_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    router.cancel(command_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            command_id,
            status: "cancel_requested",
        }),
    ))
}
