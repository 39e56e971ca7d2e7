//! Deployment rollout monitor
//!
//! Applies a deployment and follows it until the new replica set has fully
//! replaced the old one. The monitor moves through explicit phases:
//!
//! ```text
//! Applying -> WaitingGeneration -> WaitingReplicas -> WaitingHealth -> Done
//!                     \                   \                 \
//!                      +-------------------+-----------------+--> Failed
//! ```
//!
//! Each convergence iteration waits on whichever comes first: a short poll
//! tick, an event about the deployment's units, the health check timer or
//! the overall progress timeout.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, info, instrument, warn};

use super::cluster::ClusterApi;
use super::pods::{all_new_pods_running, not_ready_pod_messages};
use super::watcher::{format_event, is_deployment_event, watch_events, EventWatch, POD_KIND};
use crate::config::Config;
use crate::error::{Error, Result, TimeoutError, TimeoutPhase};
use crate::labels::{selector_string, LabelSet};
use crate::progress::Progress;

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESSING_CONDITION: &str = "Progressing";
const PROGRESS_DEADLINE_REASON: &str = "ProgressDeadlineExceeded";
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RolloutPhase {
    Applying,
    WaitingGeneration,
    WaitingReplicas,
    WaitingHealth,
    Done,
    Failed,
}

/// Last reported replica counters. Lines are only printed when a counter
/// changes, so repeated statuses and duplicate events add nothing.
#[derive(Debug, Clone, Copy)]
struct Counters {
    updated: i32,
    ready: i32,
    pending_termination: i32,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            updated: -1,
            ready: -1,
            pending_termination: -1,
        }
    }
}

/// Follows one rollout of one process deployment.
pub struct RolloutMonitor<'a, C: ?Sized> {
    cluster: &'a C,
    config: &'a Config,
    progress: &'a Progress,
    process: &'a str,
    labels: &'a LabelSet,
    phase: RolloutPhase,
    resume_token: String,
    counters: Counters,
}

impl<'a, C> RolloutMonitor<'a, C>
where
    C: ClusterApi + ?Sized,
{
    pub fn new(
        cluster: &'a C,
        config: &'a Config,
        progress: &'a Progress,
        process: &'a str,
        labels: &'a LabelSet,
    ) -> Self {
        Self {
            cluster,
            config,
            progress,
            process,
            labels,
            phase: RolloutPhase::Applying,
            resume_token: String::new(),
            counters: Counters::default(),
        }
    }

    /// Create `desired`, or replace it when `exists`. The event resume
    /// token is taken before the write so no event caused by it is missed.
    #[instrument(skip(self, desired), fields(deployment = desired.metadata.name.as_deref().unwrap_or_default()))]
    pub async fn apply(&mut self, desired: &Deployment, exists: bool) -> Result<Deployment> {
        self.phase = RolloutPhase::Applying;
        self.resume_token = match self.cluster.events_resource_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "Unable to read events resource version");
                String::new()
            }
        };

        let applied = if exists {
            self.cluster.replace_deployment(desired).await
        } else {
            self.cluster.create_deployment(desired).await
        };
        match applied {
            Ok(dep) => {
                self.phase = RolloutPhase::WaitingGeneration;
                Ok(dep)
            }
            Err(e) => {
                self.phase = RolloutPhase::Failed;
                Err(e.into())
            }
        }
    }

    /// Follow an applied deployment until it converges or fails.
    pub async fn monitor(&mut self, deployment: Deployment) -> Result<()> {
        let name = deployment.metadata.name.clone().unwrap_or_default();

        let mut watch =
            match watch_events(self.cluster, POD_KIND, None, &self.resume_token).await {
                Ok(watch) => Some(watch),
                Err(e) => {
                    warn!(deployment = %name, error = %e, "Unit events unavailable");
                    None
                }
            };

        let result = self.converge(&name, deployment, &mut watch).await;
        if let Some(watch) = watch.take() {
            watch.stop().await;
        }

        let reached = self.phase;
        self.phase = if result.is_ok() {
            RolloutPhase::Done
        } else {
            RolloutPhase::Failed
        };
        info!(deployment = %name, phase = %self.phase, reached = %reached, "Rollout finished");
        result
    }

    async fn converge(
        &mut self,
        name: &str,
        mut dep: Deployment,
        watch: &mut Option<EventWatch>,
    ) -> Result<()> {
        self.progress
            .write(format!("\n---- Updating units [{}] ----\n", self.process));

        let started = Instant::now();
        let deadline = sleep(self.config.deployment_progress_timeout());
        tokio::pin!(deadline);

        self.phase = RolloutPhase::WaitingGeneration;
        while observed_generation(&dep) < generation(&dep) {
            dep = self.cluster.get_deployment(name).await?;
            if observed_generation(&dep) >= generation(&dep) {
                break;
            }
            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                _ = &mut deadline => {
                    return Err(TimeoutError::new(TimeoutPhase::Generation, name, started.elapsed()).into());
                }
            }
        }

        self.phase = RolloutPhase::WaitingReplicas;
        let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let mut health: Option<Pin<Box<Sleep>>> = None;
        let mut watch_open = watch.is_some();

        loop {
            let status = dep.status.clone().unwrap_or_default();
            if progress_deadline_exceeded(&dep) {
                return Err(Error::ProgressDeadline(name.to_string()));
            }

            let updated = status.updated_replicas.unwrap_or(0);
            let unavailable = status.unavailable_replicas.unwrap_or(0);
            let replicas = status.replicas.unwrap_or(0);

            if self.counters.updated != updated {
                self.progress
                    .line(format!(" ---> {updated} of {desired} new units created"));
            }

            if health.is_none() && updated == desired {
                match all_new_pods_running(self.cluster, &dep, self.labels).await {
                    Ok(true) => {
                        health = Some(Box::pin(sleep(self.config.healthcheck_max_time())));
                        self.phase = RolloutPhase::WaitingHealth;
                        self.progress.line(format!(
                            " ---> waiting healthcheck on {desired} created units"
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => debug!(deployment = name, error = %e, "Unable to check new units"),
                }
            }

            let ready = updated - unavailable;
            if self.counters.ready != ready && ready >= 0 {
                self.progress
                    .line(format!(" ---> {ready} of {desired} new units ready"));
            }

            let pending_termination = replicas - updated;
            if self.counters.pending_termination != pending_termination && pending_termination > 0 {
                self.progress.line(format!(
                    " ---> {pending_termination} old units pending termination"
                ));
            }

            self.counters = Counters {
                updated,
                ready,
                pending_termination,
            };

            if ready == desired && replicas == desired {
                break;
            }

            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                event = next_event(watch), if watch_open => match event {
                    Some(event) => {
                        if is_deployment_event(&event, name) {
                            self.progress.line(format!("  ---> {}", format_event(&event, false)));
                        }
                    }
                    None => watch_open = false,
                },
                _ = health_expired(&mut health) => {
                    return Err(self.timeout_error(TimeoutPhase::Healthcheck, name, started.elapsed()).await);
                }
                _ = &mut deadline => {
                    return Err(self.timeout_error(TimeoutPhase::FullRollout, name, started.elapsed()).await);
                }
            }

            dep = self.cluster.get_deployment(name).await?;
        }

        self.progress.line(" ---> Done updating units");
        Ok(())
    }

    async fn timeout_error(&self, phase: TimeoutPhase, name: &str, elapsed: Duration) -> Error {
        let messages = match not_ready_pod_messages(self.cluster, self.labels).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(deployment = name, error = %e, "Unable to collect not-ready unit messages");
                Vec::new()
            }
        };
        for message in &messages {
            self.progress
                .line(format!(" ---> Pod not ready in time: {message}"));
        }
        TimeoutError::new(phase, name, elapsed)
            .with_messages(messages)
            .into()
    }
}

async fn next_event(watch: &mut Option<EventWatch>) -> Option<Event> {
    match watch {
        Some(watch) => watch.recv().await,
        None => None,
    }
}

async fn health_expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

fn generation(dep: &Deployment) -> i64 {
    dep.metadata.generation.unwrap_or(0)
}

fn observed_generation(dep: &Deployment) -> i64 {
    dep.status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0)
}

fn progress_deadline_exceeded(dep: &Deployment) -> bool {
    dep.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.type_ == PROGRESSING_CONDITION
                    && c.reason.as_deref() == Some(PROGRESS_DEADLINE_REASON)
            })
        })
}

fn revision(meta: &ObjectMeta) -> Option<i64> {
    meta.annotations
        .as_ref()?
        .get(REVISION_ANNOTATION)?
        .parse()
        .ok()
}

/// Roll deployment `name` back to the revision before its current one.
///
/// The pod template of the newest replica set older than the current
/// revision is copied into the deployment, which is then replaced.
#[instrument(skip(cluster))]
pub async fn rollback<C>(cluster: &C, name: &str) -> Result<Deployment>
where
    C: ClusterApi + ?Sized,
{
    let mut dep = cluster.get_deployment(name).await?;
    let current = revision(&dep.metadata).unwrap_or(0);

    let selector = dep
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .map(selector_string)
        .unwrap_or_default();
    let replica_sets = cluster.list_replica_sets(&selector).await?;

    let previous: Option<(i64, ReplicaSet)> = replica_sets
        .into_iter()
        .filter_map(|rs| revision(&rs.metadata).map(|r| (r, rs)))
        .filter(|(r, _)| *r < current)
        .max_by_key(|(r, _)| *r);
    let Some((target, rs)) = previous else {
        return Err(Error::NoPreviousRevision(name.to_string()));
    };

    let mut template = rs.spec.and_then(|s| s.template).unwrap_or_default();
    if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
        labels.remove(POD_TEMPLATE_HASH_LABEL);
    }
    if let Some(spec) = dep.spec.as_mut() {
        spec.template = template;
    }

    let dep = cluster.replace_deployment(&dep).await?;
    info!(deployment = name, from = current, to = target, "Rolled back deployment");
    Ok(dep)
}
