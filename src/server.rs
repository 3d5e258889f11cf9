//! HTTP and WebSocket server implementation using Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::process::{ProcessState, ProcessStatus};
use crate::session::StreamingSession;
use crate::state::AppState;
use crate::Result;

/// Body of `GET /health`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessStatus>,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/chat", get(ws_chat))
        .route("/health", get(health))
        .route("/process/restart", post(restart_process))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, server))
}

async fn ws_chat(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (outbound, inbound) = socket.split();
        let mut session = StreamingSession::new(state.responder.clone());
        session.run(inbound, outbound).await;
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let process = state.supervisor.as_ref().map(|s| s.status());
    let status = match process.as_ref().map(|p| p.state) {
        Some(ProcessState::Crashed) | Some(ProcessState::Stopped) => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status,
        backend: state.backend_name(),
        process,
    })
}

async fn restart_process(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<ProcessStatus>, (StatusCode, String)> {
    let supervisor = state.supervisor.as_ref().ok_or((
        StatusCode::CONFLICT,
        "mock backend has no process to restart".to_string(),
    ))?;

    supervisor
        .restart()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(supervisor.status()))
}
