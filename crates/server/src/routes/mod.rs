//! API route handlers for the mediaq server.

pub mod batches;
pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod stats;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router. Everything except `/metrics` lives under `/api`.
///
/// Routes:
/// - GET    /api/health                  - Health check
/// - POST   /api/jobs                    - Submit a job
/// - GET    /api/jobs/{id}               - Job snapshot
/// - DELETE /api/jobs/{id}               - Cancel a job
/// - GET    /api/jobs/{id}/events        - SSE progress stream
/// - GET    /api/users/{user}/jobs       - A user's jobs
/// - GET    /api/users/{user}/batches    - A user's batches
/// - GET    /api/queue                   - Running and waiting jobs
/// - GET    /api/stats                   - Scheduler and hub counters
/// - PUT    /api/settings/max-concurrent - Change the global limit
/// - POST   /api/batches                 - Submit a batch
/// - GET    /api/batches/{id}            - Aggregate batch status
/// - DELETE /api/batches/{id}            - Cancel a batch
/// - GET    /metrics                     - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", jobs::router())
        .nest("/api", events::router())
        .nest("/api", stats::router())
        .nest("/api", batches::router())
        .merge(metrics::router())
        .with_state(state)
}
