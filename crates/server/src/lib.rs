// crates/server/src/lib.rs
//! mediaq server library.
//!
//! Axum boundary over `mediaq-core`: job and batch submission, cancellation,
//! progress streaming over SSE, queue statistics and Prometheus metrics.

pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::*;
pub use metrics::{init_metrics, render_metrics};
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
