use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{stream_progress, AppState};
use crate::error::{Error, Result};
use crate::k8s::DeployRequest;
use crate::labels::LabelSet;
use crate::progress::Progress;

#[derive(Debug, Serialize)]
pub struct LabelsResponse {
    pub labels: Option<LabelSet>,
}

/// Roll out a new image for a process, streaming progress as plain text.
///
/// POST /apps/:app/processes/:process/deploy
pub async fn deploy(
    State(state): State<AppState>,
    Path((app, process)): Path<(String, String)>,
    Json(request): Json<DeployRequest>,
) -> Result<Response> {
    if request.workload.name != app {
        return Err(Error::precondition(format!(
            "workload {:?} does not match app {app:?}",
            request.workload.name
        )));
    }
    request.workload.process(&process)?;
    info!(app = %app, process = %process, image = %request.image, "Deploying process");

    let (progress, rx) = Progress::channel();
    let services = state.services.clone();
    tokio::spawn(async move {
        if let Err(e) = services.deploy_service(&process, &request, &progress).await {
            warn!(app = %app, process = %process, error = %e, "Deploy failed");
            progress.line(format!(" ---> Error: {e}"));
        }
    });

    Ok(stream_progress(rx))
}

/// Remove a process's deployment and services.
///
/// DELETE /apps/:app/processes/:process
pub async fn remove(
    State(state): State<AppState>,
    Path((app, process)): Path<(String, String)>,
) -> Result<StatusCode> {
    info!(app = %app, process = %process, "Removing process");
    state.services.remove_service(&app, &process).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Labels of the process's current units.
///
/// GET /apps/:app/processes/:process/labels
pub async fn labels(
    State(state): State<AppState>,
    Path((app, process)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let labels = state.services.current_labels(&app, &process).await?;
    Ok(Json(LabelsResponse { labels }))
}
