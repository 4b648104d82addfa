// crates/server/src/routes/stats.rs
//! Scheduler counters and the global concurrency setting.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, put},
    Json, Router,
};
use mediaq_core::{HubStats, ManagerStats};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub jobs: ManagerStats,
    pub hub: HubStats,
}

/// Out-of-range values are clamped, not rejected.
#[derive(Debug, Deserialize)]
pub struct MaxConcurrentRequest {
    pub value: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxConcurrentResponse {
    pub max_concurrent: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(stats))
        .route("/settings/max-concurrent", put(set_max_concurrent))
}

/// GET /api/stats
async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        jobs: state.jobs.stats(),
        hub: state.jobs.hub().stats(),
    })
}

/// PUT /api/settings/max-concurrent
async fn set_max_concurrent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MaxConcurrentRequest>,
) -> Json<MaxConcurrentResponse> {
    let requested = usize::try_from(req.value).unwrap_or(0);
    Json(MaxConcurrentResponse {
        max_concurrent: state.jobs.set_max_concurrent(requested),
    })
}
