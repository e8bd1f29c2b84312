use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lynx_core::FleetError;
use tracing::warn;

/// A [`FleetError`] on its way to becoming an HTTP response.
///
/// The body is always `{"error": "<message>", "kind": "<variant>"}`.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl ApiError {
    /// HTTP status for the wrapped error. Structural errors (caller
    /// mistakes against current fleet state) are conflicts.
    pub fn status(&self) -> StatusCode {
        if self.0.is_structural() {
            return StatusCode::CONFLICT;
        }
        match &self.0 {
            FleetError::UnknownAgent(_) | FleetError::UnknownTask(_) => StatusCode::NOT_FOUND,
            FleetError::AgentBusy { .. }
            | FleetError::AgentAtCapacity(_)
            | FleetError::NoReservation(_) => StatusCode::CONFLICT,
            FleetError::InvalidCapability(_) | FleetError::Config(_) | FleetError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            FleetError::DuplicateAgent(_) => "duplicate_agent",
            FleetError::AgentBusy { .. } => "agent_busy",
            FleetError::AgentAtCapacity(_) => "agent_at_capacity",
            FleetError::InvalidCapability(_) => "invalid_capability",
            FleetError::TaskAlreadyRunning(_) => "task_already_running",
            FleetError::InvalidTransition { .. } => "invalid_transition",
            FleetError::Timeout { .. } => "timeout",
            FleetError::RetriesExhausted { .. } => "retries_exhausted",
            FleetError::UnknownAgent(_) => "unknown_agent",
            FleetError::UnknownTask(_) => "unknown_task",
            FleetError::NoReservation(_) => "no_reservation",
            FleetError::Execution(_) => "execution",
            FleetError::Config(_) => "config",
            FleetError::Json(_) => "json",
            FleetError::Io(_) => "io",
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}
