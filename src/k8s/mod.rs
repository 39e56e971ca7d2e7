//! Kubernetes integration module for kubeship
//!
//! This module handles all interactions with the cluster:
//! - Running build, archive deploy and inspect work in two-container sidecar pods
//! - Rolling out process deployments and rolling them back on failure
//! - Exposing process units through services
//! - Watching cluster events and relaying them as progress lines

mod client;
mod cluster;
mod deployment;
mod pods;
mod registry;
mod resources;
mod rollout;
mod sidecar;
mod watcher;

pub use client::K8sClient;
pub use cluster::{AttachStreams, BoxError, ClusterApi, ClusterError, ClusterResult, EventStream};
pub use deployment::{DeployRequest, ServiceManager};
pub use pods::{
    all_new_pods_running, cleanup_pod, not_ready_pod_messages, wait_for_pod,
    wait_for_pod_containers_running,
};
pub use registry::{ensure_identity, image_domain, pull_secrets_for};
pub use resources::{
    create_deployment, create_headless_service, create_registry_secret, create_service,
    create_service_account, create_sidecar_pod, memory_resources, DeploymentParams, Handshake,
    SidecarPodParams, DOCKER_SOCK_PATH, INTERCONTAINER_PATH,
};
pub use rollout::{rollback, RolloutMonitor, RolloutPhase, REVISION_ANNOTATION};
pub use sidecar::{
    decode_inspect_output, split_image_name, with_latest_tag, BuildRequest, ImageConfig,
    ImageDescriptor, InspectRequest, InspectResult, SidecarRunner, BUILD_CONTAINER,
    INSPECT_CONTAINER,
};
pub use watcher::{
    event_field_selector, format_event, is_deployment_event, watch_events, EventPrinter,
    EventWatch, POD_KIND,
};
