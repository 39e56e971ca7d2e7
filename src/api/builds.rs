use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{info, warn};

use crate::api::{stream_progress, AppState};
use crate::error::{Error, Result};
use crate::k8s::{BuildRequest, InspectRequest, InspectResult};
use crate::progress::{drain_to_string, Progress};

#[derive(Debug, Deserialize)]
pub struct BuildPayload {
    #[serde(flatten)]
    pub request: BuildRequest,
    /// Base64-encoded source archive streamed into the build sidecar.
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InspectResponse {
    pub result: InspectResult,
    pub output: String,
}

fn check_app(app: &str, workload: &str) -> Result<()> {
    if app != workload {
        return Err(Error::precondition(format!(
            "workload {workload:?} does not match app {app:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ArchiveAction {
    Build,
    Deploy,
}

/// Build an image from a source archive, streaming progress as plain text.
///
/// POST /apps/:app/builds
pub async fn build(
    State(state): State<AppState>,
    Path(app): Path<String>,
    Json(payload): Json<BuildPayload>,
) -> Result<Response> {
    run_archive(state, app, payload, ArchiveAction::Build)
}

/// Deploy straight from a source archive, streaming progress as plain text.
///
/// POST /apps/:app/archive-deploys
pub async fn deploy_archive(
    State(state): State<AppState>,
    Path(app): Path<String>,
    Json(payload): Json<BuildPayload>,
) -> Result<Response> {
    run_archive(state, app, payload, ArchiveAction::Deploy)
}

fn run_archive(
    state: AppState,
    app: String,
    payload: BuildPayload,
    action: ArchiveAction,
) -> Result<Response> {
    check_app(&app, &payload.request.workload.name)?;
    let input = payload
        .input
        .as_deref()
        .map(|data| BASE64.decode(data))
        .transpose()
        .map_err(|e| Error::precondition(format!("invalid archive input: {e}")))?;
    let request = payload.request;
    info!(app = %app, version = %request.version, ?action, "Running archive sidecar");

    let (progress, rx) = Progress::channel();
    let sidecar = state.sidecar.clone();
    tokio::spawn(async move {
        let mut reader: &[u8] = input.as_deref().unwrap_or_default();
        let stdin: Option<&mut (dyn AsyncRead + Send + Unpin)> = if input.is_some() {
            Some(&mut reader)
        } else {
            None
        };
        let result = match action {
            ArchiveAction::Build => sidecar.build(&request, stdin, &progress).await,
            ArchiveAction::Deploy => sidecar.deploy(&request, stdin, &progress).await,
        };
        if let Err(e) = result {
            warn!(app = %app, error = %e, ?action, "Archive sidecar failed");
            progress.line(format!(" ---> Error: {e}"));
        }
    });

    Ok(stream_progress(rx))
}

/// Retag an existing image and return its metadata with the collected output.
///
/// POST /apps/:app/inspect
pub async fn inspect(
    State(state): State<AppState>,
    Path(app): Path<String>,
    Json(request): Json<InspectRequest>,
) -> Result<Json<InspectResponse>> {
    check_app(&app, &request.workload.name)?;
    info!(app = %app, image = %request.source_image, "Inspecting image");

    let (progress, mut rx) = Progress::channel();
    let result = state.sidecar.inspect(&request, &progress).await?;
    drop(progress);

    Ok(Json(InspectResponse {
        result,
        output: drain_to_string(&mut rx),
    }))
}
