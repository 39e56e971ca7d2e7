//! Cluster API seam
//!
//! Everything the pipelines need from the cluster goes through
//! [`ClusterApi`]: typed CRUD over namespaced objects, event watches with
//! resume tokens, attaching to a running container and following its log.
//! [`super::K8sClient`] implements it over kube-rs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Pod, Secret, Service, ServiceAccount};
use kube::api::WatchEvent;
use tokio::io::{AsyncRead, AsyncWrite};

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stream of raw watch events for cluster `Event` objects.
pub type EventStream = BoxStream<'static, ClusterResult<WatchEvent<Event>>>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name:?} not found in namespace {namespace:?}")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name:?} already exists in namespace {namespace:?}")]
    AlreadyExists {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name:?} in namespace {namespace:?}: {source}")]
    Api {
        kind: &'static str,
        name: String,
        namespace: String,
        #[source]
        source: BoxError,
    },

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("stream failed: {0}")]
    Stream(#[from] std::io::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// Container streams wired to an attach session.
///
/// Stderr is only requested when `tty` is false; a pseudo-terminal merges
/// it into stdout. The session ends as soon as stdin reaches EOF, so output
/// the container writes after its input is consumed never arrives here.
/// Use [`ClusterApi::follow_logs`] for that.
pub struct AttachStreams<'a> {
    pub stdin: Option<&'a mut (dyn AsyncRead + Send + Unpin)>,
    pub stdout: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
    pub stderr: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
    pub tty: bool,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Namespace every call is scoped to.
    fn namespace(&self) -> &str;

    async fn create_pod(&self, pod: &Pod) -> ClusterResult<Pod>;
    async fn get_pod(&self, name: &str) -> ClusterResult<Pod>;
    async fn list_pods(&self, label_selector: &str) -> ClusterResult<Vec<Pod>>;
    async fn delete_pod(&self, name: &str) -> ClusterResult<()>;

    async fn get_deployment(&self, name: &str) -> ClusterResult<Deployment>;
    async fn create_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment>;
    /// Replace the whole object.
    async fn replace_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment>;
    /// Delete with foreground propagation so owned replica sets go first.
    async fn delete_deployment(&self, name: &str) -> ClusterResult<()>;
    async fn list_replica_sets(&self, label_selector: &str) -> ClusterResult<Vec<ReplicaSet>>;

    async fn create_service(&self, service: &Service) -> ClusterResult<Service>;
    async fn delete_service(&self, name: &str) -> ClusterResult<()>;

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<Secret>;
    async fn replace_secret(&self, secret: &Secret) -> ClusterResult<Secret>;

    async fn create_service_account(&self, account: &ServiceAccount) -> ClusterResult<ServiceAccount>;

    async fn list_events(&self, field_selector: &str) -> ClusterResult<Vec<Event>>;
    /// Resource version of the event collection, usable as a watch resume token.
    async fn events_resource_version(&self) -> ClusterResult<String>;
    /// Watch events matching `field_selector` starting at `resource_version`
    /// (empty for "now"). Implementations open a dedicated connection.
    async fn watch_events(
        &self,
        field_selector: &str,
        resource_version: &str,
    ) -> ClusterResult<EventStream>;

    /// Attach to `container` of `pod` and pump the given streams until the
    /// session ends.
    async fn attach(
        &self,
        pod: &str,
        container: &str,
        streams: AttachStreams<'_>,
    ) -> ClusterResult<()>;

    /// Copy the log of `container` into `out` from its start, following it
    /// until the container terminates.
    async fn follow_logs(
        &self,
        pod: &str,
        container: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ClusterResult<()>;
}
