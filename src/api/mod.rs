pub mod builds;
pub mod health;
pub mod metrics;
pub mod response;
pub mod services;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::k8s::{ClusterApi, ServiceManager, SidecarRunner};

/// Relay a progress channel as a chunked `text/plain` body. The body ends
/// when every sender of the channel is gone.
pub fn stream_progress(rx: mpsc::UnboundedReceiver<Bytes>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub services: ServiceManager<dyn ClusterApi>,
    pub sidecar: SidecarRunner<dyn ClusterApi>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            services: ServiceManager::new(cluster.clone(), config.clone()),
            sidecar: SidecarRunner::new(cluster, config.clone()),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
