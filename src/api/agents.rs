//! Agent state queries, command dispatch, and AI analysis.

use std::sync::Arc;

use axum::{extract::Path, Extension, Json};
use chrono::{DateTime, Utc};
use ogent_core::{
    ai::CommandAnalysis, AgentRecord, CommandStatus, ExecuteRequest, Router as CommandRouter,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiError;
use crate::middleware::auth::RequireAuth;

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentRecord>,
    pub count: usize,
}

/// `GET /agents`
pub async fn list_agents(
    RequireAuth(_auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
) -> Json<AgentListResponse> {
    let agents = router.agents().list();
    let count = agents.len();
    Json(AgentListResponse { agents, count })
}

/// `GET /agents/{agent_id}`
pub async fn get_agent(
    RequireAuth(_auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    let agent = router.agents().get(&agent_id)?;
    Ok(Json(agent))
}

/// Accept envelope returned from `POST /agents/{id}/execute`.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub command_id: Uuid,
    pub agent_id: String,
    pub status: CommandStatus,
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

/// `POST /agents/{agent_id}/execute`
///
/// Accepts the command and dispatches it asynchronously. A command that
/// fails acceptance (unknown agent, unsafe command) is returned already
/// terminal; poll `GET /commands/{id}` or hold a gateway connection for
/// progress and the result.
pub async fn execute_command(
    RequireAuth(auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
    Path(agent_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let record = router.execute(&auth.user_id, &agent_id, request).await?;
    Ok(Json(ExecuteResponse {
        command_id: record.command_id,
        agent_id: record.agent_id,
        status: record.status,
        command: record.command_text,
        timestamp: record.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub command: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// `POST /agents/{agent_id}/analyze` — AI pre-processing only, no dispatch.
pub async fn analyze_command(
    RequireAuth(_auth): RequireAuth,
    Extension(router): Extension<Arc<CommandRouter>>,
    Path(agent_id): Path<String>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<CommandAnalysis>, ApiError> {
    // The agent must exist even though nothing is dispatched.
    router.agents().get(&agent_id)?;
    let analysis = router
        .ai()
        .analyze(
            &request.command,
            request.system.as_deref().unwrap_or("Linux"),
            request.context.as_deref().unwrap_or("server administration"),
        )
        .await?;
    Ok(Json(analysis))
}
