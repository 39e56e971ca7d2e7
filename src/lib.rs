//! kubeship library
//!
//! Builds workload images in sidecar pods, rolls them out as process
//! deployments and exposes the units through services.

pub mod api;
pub mod config;
pub mod error;
pub mod k8s;
pub mod labels;
pub mod progress;
pub mod workload;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the application router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Metrics (Prometheus)
        .route("/metrics", get(api::metrics::metrics_handler))
        // Images
        .route("/apps/:app/builds", post(api::builds::build))
        .route("/apps/:app/archive-deploys", post(api::builds::deploy_archive))
        .route("/apps/:app/inspect", post(api::builds::inspect))
        // Processes
        .route(
            "/apps/:app/processes/:process/deploy",
            post(api::services::deploy),
        )
        .route(
            "/apps/:app/processes/:process",
            delete(api::services::remove),
        )
        .route(
            "/apps/:app/processes/:process/labels",
            get(api::services::labels),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
