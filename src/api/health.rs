use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Namespace every provisioned object lives in.
    pub namespace: String,
    /// Private registry pull secrets are issued for, if any.
    pub registry: Option<String>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        namespace: state.config.namespace.clone(),
        registry: state.config.registry.clone(),
    })
}
