//! Pod state polling and not-ready diagnostics

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Event, Pod};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::cluster::ClusterApi;
use super::rollout::REVISION_ANNOTATION;
use super::watcher::{event_field_selector, POD_KIND};
use crate::error::{Error, Result, TimeoutError, TimeoutPhase};
use crate::labels::LabelSet;

const POD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending")
}

fn describe_termination(container: &str, term: &ContainerStateTerminated) -> String {
    let mut out = format!("container {container:?} terminated with exit code {}", term.exit_code);
    if let Some(reason) = term.reason.as_deref().filter(|r| !r.is_empty()) {
        out.push_str(&format!(" ({reason})"));
    }
    if let Some(message) = term.message.as_deref().filter(|m| !m.is_empty()) {
        out.push_str(&format!(": {message}"));
    }
    out
}

/// First terminated container of `pod`, rendered for an error message.
fn terminated_container(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .map(|t| describe_termination(&cs.name, t))
        })
}

/// Whether every declared container of `pod` reports a running state.
fn all_containers_running(pod: &Pod) -> bool {
    let declared = pod.spec.as_ref().map_or(0, |s| s.containers.len());
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return false;
    };
    declared > 0
        && statuses.len() >= declared
        && statuses
            .iter()
            .all(|cs| cs.state.as_ref().is_some_and(|s| s.running.is_some()))
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn pod_failed(pod: &Pod, name: &str) -> Error {
    let reason = terminated_container(pod)
        .or_else(|| {
            pod.status
                .as_ref()
                .and_then(|s| s.message.clone())
                .filter(|m| !m.is_empty())
        })
        .unwrap_or_else(|| "unknown reason".to_string());
    Error::PodFailed {
        pod: name.to_string(),
        reason,
    }
}

/// Block until every container of pod `name` is running.
///
/// Fails early when the pod fails or a container terminates before all of
/// them are up.
pub async fn wait_for_pod_containers_running<C>(
    cluster: &C,
    name: &str,
    timeout: Duration,
) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    let started = Instant::now();
    loop {
        let pod = cluster.get_pod(name).await?;
        match phase(&pod) {
            "Failed" => return Err(pod_failed(&pod, name)),
            "Succeeded" => return Ok(()),
            _ => {}
        }
        if all_containers_running(&pod) {
            debug!(pod = name, "All containers running");
            return Ok(());
        }
        if let Some(reason) = terminated_container(&pod) {
            return Err(Error::PodFailed {
                pod: name.to_string(),
                reason,
            });
        }
        if started.elapsed() >= timeout {
            return Err(TimeoutError::new(TimeoutPhase::PodRunning, name, started.elapsed()).into());
        }
        sleep(POD_POLL_INTERVAL).await;
    }
}

/// Block until pod `name` reaches a terminal phase. `Failed` is an error.
pub async fn wait_for_pod<C>(cluster: &C, name: &str, timeout: Duration) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    let started = Instant::now();
    loop {
        let pod = cluster.get_pod(name).await?;
        match phase(&pod) {
            "Succeeded" => return Ok(()),
            "Failed" => return Err(pod_failed(&pod, name)),
            _ => {}
        }
        if started.elapsed() >= timeout {
            return Err(TimeoutError::new(TimeoutPhase::PodReady, name, started.elapsed()).into());
        }
        sleep(POD_POLL_INTERVAL).await;
    }
}

/// Delete pod `name`; a pod that is already gone counts as cleaned up.
pub async fn cleanup_pod<C>(cluster: &C, name: &str) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    match cluster.delete_pod(name).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn event_time(event: &Event) -> Option<String> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0.to_rfc3339())
        .or_else(|| event.event_time.as_ref().map(|t| t.0.to_rfc3339()))
}

fn waiting_reason(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|cs| {
            let waiting = cs.state.as_ref()?.waiting.as_ref()?;
            let reason = waiting.reason.clone().unwrap_or_default();
            Some(match waiting.message.as_deref().filter(|m| !m.is_empty()) {
                Some(message) => format!("{reason}: {message}"),
                None => reason,
            })
        })
        .filter(|r| !r.is_empty())
}

/// Why the not-ready units matching `labels` are stuck, one line per pod:
/// the latest event about the pod, or its container waiting reason.
pub async fn not_ready_pod_messages<C>(cluster: &C, labels: &LabelSet) -> Result<Vec<String>>
where
    C: ClusterApi + ?Sized,
{
    let pods = cluster.list_pods(&labels.selector_string()).await?;
    let mut messages = Vec::new();
    for pod in pods.iter().filter(|p| !is_ready(p)) {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let mut events = cluster
            .list_events(&event_field_selector(POD_KIND, Some(name)))
            .await?;
        events.sort_by_key(event_time);
        let reason = events
            .last()
            .and_then(|e| e.message.clone())
            .or_else(|| waiting_reason(pod));
        if let Some(reason) = reason {
            messages.push(format!("Pod {name:?}: {reason}"));
        }
    }
    Ok(messages)
}

/// Whether every unit of the deployment's current revision is running.
///
/// The current revision's replica set is found through the revision
/// annotation; its pods are selected by their template hash.
pub async fn all_new_pods_running<C>(
    cluster: &C,
    deployment: &Deployment,
    labels: &LabelSet,
) -> Result<bool>
where
    C: ClusterApi + ?Sized,
{
    let revision = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION));
    let Some(revision) = revision else {
        return Ok(false);
    };

    let selector = labels.selector_string();
    let replica_sets = cluster.list_replica_sets(&selector).await?;
    let hash = replica_sets
        .iter()
        .find(|rs| {
            rs.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REVISION_ANNOTATION))
                == Some(revision)
        })
        .and_then(|rs| rs.metadata.labels.as_ref()?.get(POD_TEMPLATE_HASH_LABEL).cloned());
    let Some(hash) = hash else {
        warn!(
            deployment = deployment.metadata.name.as_deref().unwrap_or_default(),
            revision = %revision,
            "No replica set found for current revision"
        );
        return Ok(false);
    };

    let pods = cluster
        .list_pods(&format!("{selector},{POD_TEMPLATE_HASH_LABEL}={hash}"))
        .await?;
    Ok(!pods.is_empty() && pods.iter().all(all_containers_running))
}
