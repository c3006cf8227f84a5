use crate::coordinator::FlushOutcome;
use crate::event::Notification;
use crate::handler::{Disposition, EventHandler};
use crate::storage::{BatchKey, BatchRecord, BatchStatus};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Shared state for the intake API
pub struct ApiState {
    pub handler: EventHandler,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct BatchesQuery {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    pub prefix: String,
}

#[derive(Debug, Serialize)]
pub struct BatchesResponse {
    pub batches: Vec<BatchRecord>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /events
pub async fn receive_event(
    State(state): State<Arc<ApiState>>,
    Json(notification): Json<Notification>,
) -> Result<Json<Disposition>, ApiError> {
    match state.handler.handle(notification).await {
        Ok(disposition) => Ok(Json(disposition)),
        Err(e) if e.is_fatal() => Err(ApiError::InternalError(e.to_string())),
        Err(e) => {
            warn!(error = %e, "Rejected event");
            Err(ApiError::BadRequest(e.to_string()))
        }
    }
}

/// GET /batches?status=open
pub async fn list_batches(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BatchesQuery>,
) -> Result<Json<BatchesResponse>, ApiError> {
    let status: BatchStatus = query.status.parse().map_err(ApiError::BadRequest)?;
    let batches = state
        .handler
        .coordinator()
        .context()
        .batches
        .list_by_status(status)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(BatchesResponse { batches }))
}

/// GET /batches/:batch_id?prefix=bucket/in
pub async fn get_batch(
    State(state): State<Arc<ApiState>>,
    Path(batch_id): Path<String>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<BatchRecord>, ApiError> {
    let key = BatchKey::new(batch_id, query.prefix);
    let batch = state
        .handler
        .coordinator()
        .context()
        .batches
        .get(&key)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    batch
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("batch {} not found", key)))
}

/// POST /prefixes/:prefix/flush
///
/// The prefix is a single path segment, so its slashes arrive percent-encoded.
pub async fn flush_prefix(
    State(state): State<Arc<ApiState>>,
    Path(prefix): Path<String>,
) -> Result<Json<FlushOutcome>, ApiError> {
    let outcome = state
        .handler
        .coordinator()
        .check_flush(&prefix)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    outcome
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no configuration for {}", prefix)))
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
