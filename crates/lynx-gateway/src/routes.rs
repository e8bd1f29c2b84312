use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use lynx_core::{Capability, FleetError};
use lynx_fleet::{
    Agent, AgentRequest, CancelOutcome, CapabilityHealth, FleetSnapshot, Task, TaskRequest,
    TransitionRecord,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

type ApiResult<T> = Result<T, ApiError>;

// --- agents ---

/// `GET /agents`
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<Agent>> {
    Json(state.fleet.agents())
}

/// `POST /agents`
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.fleet.register_agent(request)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// `GET /agents/{id}`
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Agent>> {
    state
        .fleet
        .get_agent(id)
        .map(Json)
        .ok_or(ApiError(FleetError::UnknownAgent(id)))
}

/// `DELETE /agents/{id}`: only an idle agent can leave.
pub async fn deregister_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.fleet.deregister_agent(id)?))
}

/// `POST /agents/{id}/heartbeat`
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.fleet.heartbeat(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents/{id}/offline`
pub async fn set_offline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.fleet.set_agent_offline(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents/{id}/online`
pub async fn set_online(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.fleet.set_agent_online(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- tasks ---

/// `GET /tasks`
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Task>> {
    Json(state.fleet.tasks())
}

/// `POST /tasks`
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.fleet.submit_task(request)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// `GET /tasks/{id}`
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    state
        .fleet
        .get_task(id)
        .map(Json)
        .ok_or(ApiError(FleetError::UnknownTask(id)))
}

/// `DELETE /tasks/{id}`
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.fleet.cancel_task(id)?;
    let status = match outcome {
        CancelOutcome::Cancelled => StatusCode::OK,
        CancelOutcome::Requested => StatusCode::ACCEPTED,
    };
    Ok((status, Json(json!({ "id": id, "outcome": outcome }))))
}

/// `GET /tasks/{id}/history`
pub async fn task_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<TransitionRecord>>> {
    if state.fleet.get_task(id).is_none() {
        return Err(ApiError(FleetError::UnknownTask(id)));
    }
    Ok(Json(state.fleet.task_history(id)))
}

/// `?limit=n` for the transitions endpoint.
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    /// Defaults to 100.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// `GET /transitions`
pub async fn recent_transitions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<TransitionRecord>> {
    Json(state.fleet.recent_transitions(query.limit))
}

// --- telemetry & control ---

/// `GET /snapshot`
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Json<FleetSnapshot> {
    Json(state.fleet.snapshot())
}

/// `?tags=frontend,database`; every known capability when absent.
#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    /// Comma-separated capability tags.
    #[serde(default)]
    pub tags: Option<String>,
}

/// `GET /capabilities`
pub async fn capability_health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Json<Vec<CapabilityHealth>> {
    let tags: Vec<Capability> = query
        .tags
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(Capability::new)
        .filter(|c| !c.is_empty())
        .collect();
    Json(state.fleet.capability_health(&tags))
}

/// `POST /fleet/pause`
pub async fn pause(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.fleet.pause();
    Json(json!({ "paused": true }))
}

/// `POST /fleet/resume`
pub async fn resume(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.fleet.resume();
    Json(json!({ "paused": false }))
}
