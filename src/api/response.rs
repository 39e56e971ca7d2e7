//! API error responses
//!
//! Failures are returned as `{"success": false, "error": {"code", "message"}}`
//! with a status derived from the error kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::k8s::ClusterError;

/// Standard API error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ApiError,
}

/// Error details in API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ApiError {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::Precondition(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
        Error::Cluster(ClusterError::NotFound { .. }) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::Cluster(ClusterError::AlreadyExists { .. }) => (StatusCode::CONFLICT, "CONFLICT"),
        Error::Cluster(_) | Error::Attach { .. } | Error::Logs { .. } => {
            (StatusCode::BAD_GATEWAY, "KUBERNETES_ERROR")
        }
        Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self);
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(ErrorResponse::new(code, self.to_string()))).into_response()
    }
}
