use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubeship::{api::AppState, config::Config, create_router, k8s::K8sClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting kubeship");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(namespace = %config.namespace, "Configuration loaded");

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let k8s = K8sClient::new(&config.namespace).await?;
    k8s.health_check().await?;
    k8s.ensure_namespace().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let port = config.port;
    let state = AppState::new(Arc::new(k8s), config).with_metrics(metrics);

    // Build router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
