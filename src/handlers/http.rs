//! HTTP handlers: connection status query, connection counts, and health.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::AppError;
use crate::models::parse_session_id;
use crate::services::SessionHub;

/// Shared application state for HTTP and WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: SessionHub,
    pub environment: String,
    /// Cancelled on process shutdown; socket read loops watch it.
    pub shutdown: CancellationToken,
    /// Every upgraded socket task, so shutdown can wait for their close paths.
    pub sockets: TaskTracker,
}

impl AppState {
    pub fn new(
        hub: SessionHub,
        environment: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            environment: environment.into(),
            shutdown,
            sockets: TaskTracker::new(),
        }
    }

    pub fn hub(&self) -> &SessionHub {
        &self.hub
    }

    /// Stop accepting socket tasks and wait up to `timeout` for the running ones to
    /// finish closing. Returns false if some were still running at the deadline.
    pub async fn drain_sockets(&self, timeout: Duration) -> bool {
        self.sockets.close();
        tokio::time::timeout(timeout, self.sockets.wait()).await.is_ok()
    }
}

/// GET /api/session/:session_id/connection-status: current presence of a session.
pub async fn connection_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session_id = parse_session_id(&session_id)?;
    let status = state.hub().connection_status(session_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Connection status retrieved successfully",
        "data": status
    })))
}

/// GET /api/connections: live local connections per session.
pub async fn active_connections(State(state): State<AppState>) -> Json<serde_json::Value> {
    let counts = state.hub().active_connections().await;
    let total: usize = counts.values().sum();
    let sessions: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(id, n)| (id.to_string(), json!(n)))
        .collect();
    Json(json!({ "total": total, "sessions": sessions }))
}

/// GET /health: liveness check.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "livechat-broker",
            "environment": state.environment
        })),
    )
}
