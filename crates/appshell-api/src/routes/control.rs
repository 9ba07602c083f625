//! Control endpoints: status, control messages and redeploys

use appshell_core::{ControlMessage, HostStatus, ServiceWorker};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub version: String,
}

/// GET /__appshell/status
async fn status(State(state): State<AppState>) -> Result<Json<HostStatus>, ApiError> {
    Ok(Json(state.host.status().await?))
}

/// POST /__appshell/message
async fn post_message(
    State(state): State<AppState>,
    Json(message): Json<ControlMessage>,
) -> Result<StatusCode, ApiError> {
    state.host.post_message(message).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /__appshell/update
///
/// Registers a worker for a new version. Responds once install (and
/// activation, if it takes over) has finished.
async fn update(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<HostStatus>, ApiError> {
    info!("Deploying version {}", request.version);

    let config = state.worker_config.with_version(request.version);
    let host = &state.host;
    let worker = ServiceWorker::new(config, host.cache().clone(), host.fetcher().clone())?;
    host.register(Arc::new(worker)).await?;

    Ok(Json(host.status().await?))
}

/// Create control routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/__appshell/status", get(status))
        .route("/__appshell/message", post(post_message))
        .route("/__appshell/update", post(update))
}
