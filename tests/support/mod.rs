//! In-memory cluster used by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Event, EventSource, ObjectReference, Pod, PodCondition, PodStatus, Secret, Service,
    ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::WatchEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use kubeship::config::Config;
use kubeship::k8s::{
    AttachStreams, ClusterApi, ClusterError, ClusterResult, EventStream, REVISION_ANNOTATION,
};
use kubeship::labels::LabelSet;
use kubeship::workload::{HealthCheck, Process, Workload};

pub const NAMESPACE: &str = "kubeship";

/// How sidecar pods behave once created.
#[derive(Debug, Clone, PartialEq)]
pub enum PodMode {
    /// Containers start, then the pod succeeds on the next read.
    Completes,
    /// Containers stay in `ContainerCreating` forever.
    NeverStarts,
    /// A container terminates with the given message.
    Fails(String),
}

/// Failure to inject into one cluster operation.
#[derive(Debug, Clone)]
pub enum Fail {
    NotFound,
    AlreadyExists,
    Api(String),
}

#[derive(Default)]
pub struct FakeState {
    pub pods: BTreeMap<String, Pod>,
    pub pod_reads: HashMap<String, usize>,
    pub deployments: BTreeMap<String, Deployment>,
    pub replica_sets: Vec<ReplicaSet>,
    pub services: BTreeMap<String, Service>,
    pub secrets: BTreeMap<String, Secret>,
    pub service_accounts: BTreeMap<String, ServiceAccount>,
    pub events: Vec<Event>,
    /// Resource version handed to the next emitted event.
    pub event_version: u64,
    /// Events emitted the next time an operation is called.
    pub emit_on: HashMap<&'static str, Vec<Event>>,
    /// Every call, as `<operation>:<object>`.
    pub calls: Vec<String>,
    /// Statuses handed out by successive deployment reads once a rollout
    /// has been applied; the last one sticks.
    pub statuses: VecDeque<DeploymentStatus>,
    pub rolling: bool,
    pub failures: HashMap<&'static str, Fail>,
    pub watchers: Vec<Watcher>,
    /// What the sidecar writes to its log.
    pub container_log: Vec<u8>,
    /// Hold the log back until an attach session has delivered its input,
    /// like an agent that reads stdin to EOF before printing.
    pub log_after_input: bool,
    pub attached_input: Vec<u8>,
    /// Whether the last attach asked for stdout.
    pub attach_requested_stdout: bool,
    pub pod_mode: Option<PodMode>,
    /// Deployment reads that still report the previous generation as
    /// observed.
    pub generation_lag: usize,
}

/// An open event watch and the field selector it was opened with.
pub struct Watcher {
    tx: mpsc::UnboundedSender<ClusterResult<WatchEvent<Event>>>,
    selector: String,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    pub state: Arc<Mutex<FakeState>>,
    input_closed: Arc<Notify>,
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v),
            None => false,
        })
}

fn field_value<'a>(selector: &'a str, field: &str) -> Option<&'a str> {
    selector.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == field).then_some(v)
    })
}

/// Whether `event` passes an `involvedObject.*` field selector.
fn selects(selector: &str, event: &Event) -> bool {
    let involved = &event.involved_object;
    let kind = field_value(selector, "involvedObject.kind");
    let name = field_value(selector, "involvedObject.name");
    kind.map_or(true, |k| involved.kind.as_deref() == Some(k))
        && name.map_or(true, |n| involved.name.as_deref() == Some(n))
}

fn event_version(event: &Event) -> u64 {
    event
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn running() -> ContainerState {
    ContainerState {
        running: Some(ContainerStateRunning::default()),
        ..Default::default()
    }
}

fn revision_of(meta: &ObjectMeta) -> i64 {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .and_then(|r| r.parse().ok())
        .unwrap_or(0)
}

impl FakeCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.state().pod_mode = Some(PodMode::Completes);
        cluster
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn fail(&self, op: &'static str, fail: Fail) {
        self.state().failures.insert(op, fail);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Watches whose consumer has not gone away yet.
    pub fn open_watches(&self) -> usize {
        self.state()
            .watchers
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }

    pub fn push_status(&self, status: DeploymentStatus) {
        self.state().statuses.push_back(status);
    }

    /// Send `event` to every open watch it matches and keep it for listing
    /// and resumed watches.
    pub fn emit_event(&self, event: Event) {
        Self::emit(&mut self.state(), event);
    }

    /// Emit `event` the next time `op` is called.
    pub fn emit_on(&self, op: &'static str, event: Event) {
        self.state().emit_on.entry(op).or_default().push(event);
    }

    fn emit(state: &mut FakeState, mut event: Event) {
        state.event_version += 1;
        event.metadata.resource_version = Some((100 + state.event_version).to_string());
        state.events.push(event.clone());
        state.watchers.retain(|w| {
            !selects(&w.selector, &event) || w.tx.send(Ok(WatchEvent::Added(event.clone()))).is_ok()
        });
    }

    /// Seed an existing deployment at `revision` together with its
    /// replica set.
    pub fn seed_deployment(&self, mut dep: Deployment, revision: i64) {
        let name = dep.metadata.name.clone().unwrap_or_default();
        dep.metadata.generation = Some(1);
        dep.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
        let mut state = self.state();
        Self::record_replica_set(&mut state, &dep, revision);
        state.deployments.insert(name, dep);
    }

    /// Add a running unit of the deployment's current revision.
    pub fn add_unit(&self, name: &str, labels: &LabelSet, revision: i64, ready: bool) {
        let mut pod_labels = labels.to_labels();
        pod_labels.insert("pod-template-hash".to_string(), format!("hash{revision}"));
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(pod_labels),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                containers: vec![k8s_openapi::api::core::v1::Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    state: Some(running()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        self.state().pods.insert(name.to_string(), pod);
    }

    fn record_replica_set(state: &mut FakeState, dep: &Deployment, revision: i64) {
        let name = dep.metadata.name.clone().unwrap_or_default();
        let mut template = dep
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();
        let hash = format!("hash{revision}");
        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.insert("pod-template-hash".to_string(), hash.clone());
        template.metadata.get_or_insert_with(Default::default).labels = Some(labels.clone());

        state.replica_sets.push(ReplicaSet {
            metadata: ObjectMeta {
                name: Some(format!("{name}-{hash}")),
                labels: Some(labels.clone()),
                annotations: Some(
                    [(REVISION_ANNOTATION.to_string(), revision.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ReplicaSetSpec {
                selector: LabelSelector {
                    match_labels: Some(labels),
                    ..Default::default()
                },
                template: Some(template),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    fn check(&self, op: &'static str, kind: &'static str, name: &str) -> ClusterResult<()> {
        let mut state = self.state();
        state.calls.push(format!("{op}:{name}"));
        for event in state.emit_on.remove(op).unwrap_or_default() {
            Self::emit(&mut state, event);
        }
        let Some(fail) = state.failures.get(op).cloned() else {
            return Ok(());
        };
        let name = name.to_string();
        let namespace = NAMESPACE.to_string();
        Err(match fail {
            Fail::NotFound => ClusterError::NotFound {
                kind,
                name,
                namespace,
            },
            Fail::AlreadyExists => ClusterError::AlreadyExists {
                kind,
                name,
                namespace,
            },
            Fail::Api(msg) => ClusterError::Api {
                kind,
                name,
                namespace,
                source: msg.into(),
            },
        })
    }

    fn not_found(kind: &'static str, name: &str) -> ClusterError {
        ClusterError::NotFound {
            kind,
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
        }
    }

    fn already_exists(kind: &'static str, name: &str) -> ClusterError {
        ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
        }
    }

    fn pod_status(pod: &Pod, mode: &PodMode, reads: usize) -> PodStatus {
        let names: Vec<String> = pod
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();
        let statuses = |state: &dyn Fn(usize) -> ContainerState| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| ContainerStatus {
                    name: name.clone(),
                    state: Some(state(i)),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        };
        match mode {
            PodMode::Completes if reads > 1 => PodStatus {
                phase: Some("Succeeded".to_string()),
                ..Default::default()
            },
            PodMode::Completes => PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(statuses(&|_| running())),
                ..Default::default()
            },
            PodMode::NeverStarts => PodStatus {
                phase: Some("Pending".to_string()),
                container_statuses: Some(statuses(&|_| ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ContainerCreating".to_string()),
                        message: None,
                    }),
                    ..Default::default()
                })),
                ..Default::default()
            },
            PodMode::Fails(message) => PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(statuses(&|i| {
                    if i == 1 {
                        ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: 1,
                                message: Some(message.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }
                    } else {
                        running()
                    }
                })),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn namespace(&self) -> &str {
        NAMESPACE
    }

    async fn create_pod(&self, pod: &Pod) -> ClusterResult<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.check("create_pod", "pod", &name)?;
        let mut state = self.state();
        if state.pods.contains_key(&name) {
            return Err(Self::already_exists("pod", &name));
        }
        state.pods.insert(name, pod.clone());
        Ok(pod.clone())
    }

    async fn get_pod(&self, name: &str) -> ClusterResult<Pod> {
        self.check("get_pod", "pod", name)?;
        let mut state = self.state();
        let reads = {
            let reads = state.pod_reads.entry(name.to_string()).or_insert(0);
            *reads += 1;
            *reads
        };
        let mode = state.pod_mode.clone().unwrap_or(PodMode::Completes);
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| Self::not_found("pod", name))?;
        pod.status = Some(Self::pod_status(pod, &mode, reads));
        Ok(pod.clone())
    }

    async fn list_pods(&self, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        self.check("list_pods", "pod", label_selector)?;
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| matches_selector(p.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.check("delete_pod", "pod", name)?;
        self.state()
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("pod", name))
    }

    async fn get_deployment(&self, name: &str) -> ClusterResult<Deployment> {
        self.check("get_deployment", "deployment", name)?;
        let mut state = self.state();
        if !state.deployments.contains_key(name) {
            return Err(Self::not_found("deployment", name));
        }
        let status = if !state.rolling {
            None
        } else if state.statuses.len() > 1 {
            state.statuses.pop_front()
        } else {
            state.statuses.front().cloned()
        };
        let lagging = status.is_some() && state.generation_lag > 0;
        if lagging {
            state.generation_lag -= 1;
        }
        let dep = state
            .deployments
            .get_mut(name)
            .ok_or_else(|| Self::not_found("deployment", name))?;
        if let Some(mut status) = status {
            if status.observed_generation.is_none() {
                let generation = dep.metadata.generation.unwrap_or(1);
                status.observed_generation =
                    Some(if lagging { generation - 1 } else { generation });
            }
            dep.status = Some(status);
        }
        Ok(dep.clone())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.check("create_deployment", "deployment", &name)?;
        let mut state = self.state();
        if state.deployments.contains_key(&name) {
            return Err(Self::already_exists("deployment", &name));
        }
        let mut dep = deployment.clone();
        dep.metadata.generation = Some(1);
        dep.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(REVISION_ANNOTATION.to_string(), "1".to_string());
        Self::record_replica_set(&mut state, &dep, 1);
        state.rolling = true;
        state.deployments.insert(name, dep.clone());
        Ok(dep)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.check("replace_deployment", "deployment", &name)?;
        let mut state = self.state();
        let current = state
            .deployments
            .get(&name)
            .cloned()
            .ok_or_else(|| Self::not_found("deployment", &name))?;
        let revision = state
            .replica_sets
            .iter()
            .map(|rs| revision_of(&rs.metadata))
            .max()
            .unwrap_or(0)
            + 1;
        let mut dep = deployment.clone();
        dep.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        dep.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
        dep.status = current.status;
        Self::record_replica_set(&mut state, &dep, revision);
        state.rolling = true;
        state.deployments.insert(name, dep.clone());
        Ok(dep)
    }

    async fn delete_deployment(&self, name: &str) -> ClusterResult<()> {
        self.check("delete_deployment", "deployment", name)?;
        self.state()
            .deployments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("deployment", name))
    }

    async fn list_replica_sets(&self, label_selector: &str) -> ClusterResult<Vec<ReplicaSet>> {
        self.check("list_replica_sets", "replicaset", label_selector)?;
        Ok(self
            .state()
            .replica_sets
            .iter()
            .filter(|rs| matches_selector(rs.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_service(&self, service: &Service) -> ClusterResult<Service> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.check("create_service", "service", &name)?;
        let mut state = self.state();
        if state.services.contains_key(&name) {
            return Err(Self::already_exists("service", &name));
        }
        state.services.insert(name, service.clone());
        Ok(service.clone())
    }

    async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        self.check("delete_service", "service", name)?;
        self.state()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("service", name))
    }

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<Secret> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.check("create_secret", "secret", &name)?;
        self.state().secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn replace_secret(&self, secret: &Secret) -> ClusterResult<Secret> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.check("replace_secret", "secret", &name)?;
        let mut state = self.state();
        if !state.secrets.contains_key(&name) {
            return Err(Self::not_found("secret", &name));
        }
        state.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> ClusterResult<ServiceAccount> {
        let name = account.metadata.name.clone().unwrap_or_default();
        self.check("create_service_account", "serviceaccount", &name)?;
        let mut state = self.state();
        if state.service_accounts.contains_key(&name) {
            return Err(Self::already_exists("serviceaccount", &name));
        }
        state.service_accounts.insert(name, account.clone());
        Ok(account.clone())
    }

    async fn list_events(&self, field_selector: &str) -> ClusterResult<Vec<Event>> {
        self.check("list_events", "event", field_selector)?;
        let name = field_value(field_selector, "involvedObject.name");
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| name.is_none() || e.involved_object.name.as_deref() == name)
            .cloned()
            .collect())
    }

    async fn events_resource_version(&self) -> ClusterResult<String> {
        self.check("events_resource_version", "event", "")?;
        Ok((100 + self.state().event_version).to_string())
    }

    async fn watch_events(
        &self,
        field_selector: &str,
        resource_version: &str,
    ) -> ClusterResult<EventStream> {
        self.check("watch_events", "event", field_selector)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        // Resuming replays what happened after the token.
        if let Ok(since) = resource_version.parse::<u64>() {
            for event in state
                .events
                .iter()
                .filter(|e| event_version(e) > since && selects(field_selector, e))
            {
                let _ = tx.send(Ok(WatchEvent::Added(event.clone())));
            }
        }
        state.watchers.push(Watcher {
            tx,
            selector: field_selector.to_string(),
        });
        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn attach(
        &self,
        pod: &str,
        container: &str,
        streams: AttachStreams<'_>,
    ) -> ClusterResult<()> {
        self.check("attach", "pod", &format!("{pod}/{container}"))?;
        let mut input = Vec::new();
        if let Some(stdin) = streams.stdin {
            stdin.read_to_end(&mut input).await?;
        }
        {
            let mut state = self.state();
            state.attached_input = input;
            state.attach_requested_stdout = streams.stdout.is_some();
        }
        // The session closes with stdin: whatever the container prints after
        // reading its input never reaches the attached writers.
        self.input_closed.notify_one();
        Ok(())
    }

    async fn follow_logs(
        &self,
        pod: &str,
        container: &str,
        out: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    ) -> ClusterResult<()> {
        self.check("follow_logs", "pod", &format!("{pod}/{container}"))?;
        let wait_for_input = self.state().log_after_input;
        if wait_for_input {
            self.input_closed.notified().await;
        }
        let log = self.state().container_log.clone();
        out.write_all(&log).await?;
        Ok(())
    }
}

pub fn config() -> Config {
    Config {
        overcommit_factor: Some(2),
        ..Config::default()
    }
}

pub fn registry_config() -> Config {
    Config {
        registry: Some("registry.example.com".to_string()),
        registry_username: Some("user".to_string()),
        registry_password: Some("secret".to_string()),
        ..config()
    }
}

pub fn workload() -> Workload {
    Workload::new("myapp").with_process(
        "web",
        Process {
            command: vec!["python".to_string(), "app.py".to_string()],
            port: Some(8000),
            healthcheck: Some(HealthCheck {
                path: "/health".to_string(),
                ..Default::default()
            }),
        },
    )
}

pub fn status(updated: i32, unavailable: i32, replicas: i32) -> DeploymentStatus {
    DeploymentStatus {
        updated_replicas: Some(updated),
        unavailable_replicas: Some(unavailable),
        replicas: Some(replicas),
        ..Default::default()
    }
}

/// Event about a container of `pod`, as the kubelet reports it.
pub fn container_event(pod: &str, container: &str, message: &str) -> Event {
    Event {
        involved_object: ObjectReference {
            field_path: Some(format!("spec.containers{{{container}}}")),
            ..pod_event(pod, message).involved_object
        },
        source: Some(EventSource {
            component: Some("kubelet".to_string()),
            host: Some("node-1".to_string()),
        }),
        ..pod_event(pod, message)
    }
}

pub fn pod_event(pod: &str, message: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{pod}.1")),
            ..Default::default()
        },
        involved_object: ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(pod.to_string()),
            ..Default::default()
        },
        message: Some(message.to_string()),
        ..Default::default()
    }
}
