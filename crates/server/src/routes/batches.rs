// crates/server/src/routes/batches.rs
//! Batch submission, aggregate status and cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mediaq_core::{BatchRecord, BatchRequest, BatchStatus};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBatchResponse {
    pub batch_id: String,
    pub canceled: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/batches", post(create_batch))
        .route("/batches/{id}", get(batch_status).delete(cancel_batch))
        .route("/users/{user}/batches", get(user_batches))
}

/// POST /api/batches
async fn create_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchRecord>)> {
    let record = state.batches.create_batch(req)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/batches/{id}
async fn batch_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<BatchStatus>> {
    Ok(Json(state.batches.batch_status(&id)?))
}

/// DELETE /api/batches/{id}
async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelBatchResponse>> {
    let canceled = state.batches.cancel_batch(&id).await?;
    Ok(Json(CancelBatchResponse {
        batch_id: id,
        canceled,
    }))
}

/// GET /api/users/{user}/batches
async fn user_batches(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Json<Vec<BatchRecord>> {
    Json(state.batches.user_batches(&user))
}
