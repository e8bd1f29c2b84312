use crate::routes;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use lynx_fleet::Fleet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    /// The fleet every handler operates on.
    pub fleet: Fleet,
}

/// The fleet gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router. The caller owns the fleet's distribution loop.
    pub fn build(fleet: Fleet) -> Router {
        let state = Arc::new(AppState { fleet });

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route(
                "/agents",
                get(routes::list_agents).post(routes::register_agent),
            )
            .route(
                "/agents/{id}",
                get(routes::get_agent).delete(routes::deregister_agent),
            )
            .route("/agents/{id}/heartbeat", post(routes::heartbeat))
            .route("/agents/{id}/offline", post(routes::set_offline))
            .route("/agents/{id}/online", post(routes::set_online))
            .route("/tasks", get(routes::list_tasks).post(routes::submit_task))
            .route("/tasks/{id}", get(routes::get_task).delete(routes::cancel_task))
            .route("/tasks/{id}/history", get(routes::task_history))
            .route("/transitions", get(routes::recent_transitions))
            .route("/snapshot", get(routes::snapshot))
            .route("/capabilities", get(routes::capability_health))
            .route("/fleet/pause", post(routes::pause))
            .route("/fleet/resume", post(routes::resume))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lynx",
        "paused": state.fleet.is_paused(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Stream every fleet event to the client until it disconnects.
/// Inbound messages are ignored apart from `Close`.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    // subscribe before the welcome so nothing falls between the two
    let mut events = state.fleet.subscribe();

    info!(connection_id = %connection_id, "WebSocket connected");

    let welcome = serde_json::json!({
        "type": "connected",
        "connection_id": connection_id,
        "snapshot": state.fleet.snapshot(),
    });
    if ws_sender
        .send(Message::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let text = match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize fleet event");
                        continue;
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    serde_json::json!({ "type": "lagged", "skipped": skipped }).to_string()
                }
                Err(RecvError::Closed) => break,
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(connection_id = %connection_id, "WebSocket disconnected");
}
