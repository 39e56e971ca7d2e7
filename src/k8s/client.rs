//! Kubernetes client wrapper implementing [`ClusterApi`] over kube-rs

use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncReadExt, SinkExt, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{
        Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams, TerminalSize,
        WatchParams,
    },
    Client, Config,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::cluster::{AttachStreams, ClusterApi, ClusterError, ClusterResult, EventStream};

/// Idle timeout for watch and log connections.
const WATCH_READ_TIMEOUT: Duration = Duration::from_secs(3600);

/// Terminal size hint sent when attaching with a pseudo-terminal.
const ATTACH_TERMINAL_SIZE: TerminalSize = TerminalSize {
    width: 1000,
    height: 1000,
};

/// Wrapper around kube::Client scoped to one namespace
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    config: Config,
    namespace: String,
}

impl K8sClient {
    /// Create a new K8sClient using the default kubeconfig or in-cluster config
    #[instrument(skip_all)]
    pub async fn new(namespace: &str) -> anyhow::Result<Self> {
        let config = Config::infer().await?;
        let client = Client::try_from(config.clone())?;

        info!(namespace, "Connected to Kubernetes cluster");

        Ok(Self {
            client,
            config,
            namespace: namespace.to_string(),
        })
    }

    /// Get the inner kube Client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Ensure the target namespace exists
    #[instrument(skip(self))]
    pub async fn ensure_namespace(&self) -> anyhow::Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: Some(
                    [(
                        "app.kubernetes.io/managed-by".to_string(),
                        "kubeship".to_string(),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "Created namespace");
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(namespace = %self.namespace, "Namespace already exists");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Check if cluster is reachable
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let version = self.client.apiserver_version().await?;
        info!(version = %version.git_version, "Kubernetes cluster is healthy");
        Ok(())
    }

    /// Dedicated connection for watches and log follows, which stay silent
    /// for long stretches and would trip the shared client's read timeout.
    fn long_lived_client(&self) -> kube::Result<Client> {
        let mut config = self.config.clone();
        config.read_timeout = Some(WATCH_READ_TIMEOUT);
        Client::try_from(config)
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn map_err(&self, kind: &'static str, name: &str) -> impl FnOnce(kube::Error) -> ClusterError {
        let name = name.to_string();
        let namespace = self.namespace.clone();
        move |err| match err {
            kube::Error::Api(e) if e.code == 404 => ClusterError::NotFound {
                kind,
                name,
                namespace,
            },
            kube::Error::Api(e) if e.code == 409 => ClusterError::AlreadyExists {
                kind,
                name,
                namespace,
            },
            other => ClusterError::Api {
                kind,
                name,
                namespace,
                source: Box::new(other),
            },
        }
    }
}

fn object_name(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or("unknown")
}

#[async_trait]
impl ClusterApi for K8sClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self, pod), fields(pod = %object_name(&pod.metadata)))]
    async fn create_pod(&self, pod: &Pod) -> ClusterResult<Pod> {
        let created = self
            .api::<Pod>()
            .create(&PostParams::default(), pod)
            .await
            .map_err(self.map_err("pod", object_name(&pod.metadata)))?;
        info!("Created pod");
        Ok(created)
    }

    async fn get_pod(&self, name: &str) -> ClusterResult<Pod> {
        self.api::<Pod>()
            .get(name)
            .await
            .map_err(self.map_err("pod", name))
    }

    async fn list_pods(&self, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let list = self
            .api::<Pod>()
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(self.map_err("pod", label_selector))?;
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.api::<Pod>()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(self.map_err("pod", name))?;
        info!(name, "Deleted pod");
        Ok(())
    }

    async fn get_deployment(&self, name: &str) -> ClusterResult<Deployment> {
        self.api::<Deployment>()
            .get(name)
            .await
            .map_err(self.map_err("deployment", name))
    }

    #[instrument(skip(self, deployment), fields(deployment = %object_name(&deployment.metadata)))]
    async fn create_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment> {
        let created = self
            .api::<Deployment>()
            .create(&PostParams::default(), deployment)
            .await
            .map_err(self.map_err("deployment", object_name(&deployment.metadata)))?;
        info!("Created deployment");
        Ok(created)
    }

    #[instrument(skip(self, deployment), fields(deployment = %object_name(&deployment.metadata)))]
    async fn replace_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment> {
        let name = object_name(&deployment.metadata);
        let updated = self
            .api::<Deployment>()
            .replace(name, &PostParams::default(), deployment)
            .await
            .map_err(self.map_err("deployment", name))?;
        info!("Updated deployment");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn delete_deployment(&self, name: &str) -> ClusterResult<()> {
        self.api::<Deployment>()
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(self.map_err("deployment", name))?;
        info!(name, "Deleted deployment");
        Ok(())
    }

    async fn list_replica_sets(&self, label_selector: &str) -> ClusterResult<Vec<ReplicaSet>> {
        let list = self
            .api::<ReplicaSet>()
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(self.map_err("replicaset", label_selector))?;
        Ok(list.items)
    }

    #[instrument(skip(self, service), fields(service = %object_name(&service.metadata)))]
    async fn create_service(&self, service: &Service) -> ClusterResult<Service> {
        let created = self
            .api::<Service>()
            .create(&PostParams::default(), service)
            .await
            .map_err(self.map_err("service", object_name(&service.metadata)))?;
        info!("Created service");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        self.api::<Service>()
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(self.map_err("service", name))?;
        info!(name, "Deleted service");
        Ok(())
    }

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<Secret> {
        self.api::<Secret>()
            .create(&PostParams::default(), secret)
            .await
            .map_err(self.map_err("secret", object_name(&secret.metadata)))
    }

    async fn replace_secret(&self, secret: &Secret) -> ClusterResult<Secret> {
        let name = object_name(&secret.metadata);
        self.api::<Secret>()
            .replace(name, &PostParams::default(), secret)
            .await
            .map_err(self.map_err("secret", name))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> ClusterResult<ServiceAccount> {
        self.api::<ServiceAccount>()
            .create(&PostParams::default(), account)
            .await
            .map_err(self.map_err("serviceaccount", object_name(&account.metadata)))
    }

    async fn list_events(&self, field_selector: &str) -> ClusterResult<Vec<Event>> {
        let list = self
            .api::<Event>()
            .list(&ListParams::default().fields(field_selector))
            .await
            .map_err(self.map_err("event", field_selector))?;
        Ok(list.items)
    }

    async fn events_resource_version(&self) -> ClusterResult<String> {
        let list = self
            .api::<Event>()
            .list_metadata(&ListParams::default().limit(1))
            .await
            .map_err(self.map_err("event", ""))?;
        Ok(list.metadata.resource_version.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn watch_events(
        &self,
        field_selector: &str,
        resource_version: &str,
    ) -> ClusterResult<EventStream> {
        let client = self
            .long_lived_client()
            .map_err(self.map_err("event", field_selector))?;
        let events: Api<Event> = Api::namespaced(client, &self.namespace);

        let params = WatchParams::default().fields(field_selector);
        let version = resource_version.to_string();
        let on_err = self.map_err("event", field_selector);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let stream = match events.watch(&params, &version).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(on_err(e)));
                    return;
                }
            };
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    item = stream.next() => {
                        let Some(item) = item else { break };
                        let item = item.map_err(|e| ClusterError::Watch(e.to_string()));
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Event watch connection closed");
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ClusterError::Watch("watch task exited early".to_string())),
        }

        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    #[instrument(skip(self, streams), fields(tty = streams.tty))]
    async fn attach(
        &self,
        pod: &str,
        container: &str,
        streams: AttachStreams<'_>,
    ) -> ClusterResult<()> {
        let AttachStreams {
            stdin,
            stdout,
            stderr,
            tty,
        } = streams;
        let params = AttachParams {
            container: Some(container.to_string()),
            stdin: stdin.is_some(),
            stdout: stdout.is_some(),
            stderr: !tty && stderr.is_some(),
            tty,
            ..Default::default()
        };

        let mut attached = self
            .api::<Pod>()
            .attach(pod, &params)
            .await
            .map_err(self.map_err("pod", pod))?;

        if tty {
            if let Some(mut size_tx) = attached.terminal_size() {
                if let Err(e) = size_tx.send(ATTACH_TERMINAL_SIZE).await {
                    warn!(error = %e, "Failed to send terminal size");
                }
            }
        }

        let stdin_writer = attached.stdin();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();

        // Closing stdin closes the whole session.
        let feed = async move {
            if let (Some(input), Some(mut writer)) = (stdin, stdin_writer) {
                tokio::io::copy(input, &mut writer).await?;
                writer.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let out = async move {
            if let (Some(mut reader), Some(writer)) = (stdout_reader, stdout) {
                tokio::io::copy(&mut reader, writer).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let err = async move {
            if let (Some(mut reader), Some(writer)) = (stderr_reader, stderr) {
                tokio::io::copy(&mut reader, writer).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::try_join!(feed, out, err)?;

        attached.join().await.map_err(|e| ClusterError::Api {
            kind: "pod",
            name: format!("{pod}/{container}"),
            namespace: self.namespace.clone(),
            source: Box::new(e),
        })?;
        Ok(())
    }

    #[instrument(skip(self, out))]
    async fn follow_logs(
        &self,
        pod: &str,
        container: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ClusterResult<()> {
        let client = self.long_lived_client().map_err(self.map_err("pod", pod))?;
        let pods: Api<Pod> = Api::namespaced(client, &self.namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        let logs = pods
            .log_stream(pod, &params)
            .await
            .map_err(self.map_err("pod", pod))?;
        let mut logs = std::pin::pin!(logs);

        let mut buf = vec![0u8; 8192];
        loop {
            let n = logs.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        debug!(pod, container, "Log stream ended");
        Ok(())
    }
}
