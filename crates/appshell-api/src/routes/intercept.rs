//! Fallback handler turning requests into fetch events

use appshell_core::FetchEvent;
use axum::{
    body::{self, Body},
    extract::{Request, State},
    response::Response,
};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn intercept(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let body = body::to_bytes(body, state.body_limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))?;

    debug!("{} {}", parts.method, parts.uri);

    let event = FetchEvent::new(http::Request::from_parts(parts, body));
    let response = state.host.fetch(event).await;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::from_stream(body.into_stream())))
}
