// crates/server/src/routes/jobs.rs
//! Job submission, lookup and cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use mediaq_core::{JobId, JobSnapshot, JobSpec, JobStatus, JobType, QueueInfo};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of `POST /api/jobs`. `userId` and `concurrencyCap` come from the
/// upstream policy layer; this server does not check them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub user_id: String,
    pub concurrency_cap: usize,
    pub source: String,
    /// Defaults to the job id.
    #[serde(default)]
    pub tmp_id: Option<String>,
    /// Defaults to `storage.tmp_dir`.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub canceled: bool,
    pub status: JobStatus,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", axum::routing::post(create_job))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/users/{user}/jobs", get(user_jobs))
        .route("/queue", get(queue))
}

/// POST /api/jobs
async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let source = req.source.trim();
    if source.is_empty() {
        return Err(ApiError::BadRequest("source must not be empty".into()));
    }
    if req.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("userId must not be empty".into()));
    }
    if let Some(tmp_id) = &req.tmp_id {
        if tmp_id.is_empty() || tmp_id.contains(['/', '\\']) {
            return Err(ApiError::BadRequest(format!("invalid tmpId: {tmp_id:?}")));
        }
    }

    let id = req.id.map(JobId::new).unwrap_or_else(JobId::generate);
    let spec = JobSpec {
        tmp_id: req.tmp_id.unwrap_or_else(|| id.to_string()),
        id: Some(id),
        job_type: req.job_type,
        user_id: req.user_id,
        concurrency_cap: req.concurrency_cap,
        tmp_dir: req
            .tmp_dir
            .unwrap_or_else(|| state.config.storage.tmp_dir.clone()),
        source: source.to_string(),
    };
    let job = state.jobs.submit(spec)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    state
        .jobs
        .get(&JobId::new(id.clone()))
        .map(Json)
        .ok_or(ApiError::JobNotFound(id))
}

/// DELETE /api/jobs/{id} - cancel. Canceling a finished job is not an
/// error; `canceled` is false and `status` reports how it ended.
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let job_id = JobId::new(id.clone());
    let canceled = state
        .jobs
        .cancel(&job_id, Some("canceled by request".to_string()))
        .await?;
    let status = state
        .jobs
        .get(&job_id)
        .map(|j| j.status)
        .ok_or(ApiError::JobNotFound(id))?;
    Ok(Json(CancelResponse { canceled, status }))
}

/// GET /api/users/{user}/jobs
async fn user_jobs(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Json<Vec<JobSnapshot>> {
    Json(state.jobs.user_jobs(&user))
}

/// GET /api/queue
async fn queue(State(state): State<Arc<AppState>>) -> Json<QueueInfo> {
    Json(state.jobs.queue_info())
}
