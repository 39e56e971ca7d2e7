//! Service manager for workload process deployments
//!
//! Handles the lifecycle of a process's units: rolling out a new image,
//! rolling back when the rollout fails, exposing the units through
//! services and tearing everything down again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::cluster::{ClusterApi, ClusterResult};
use super::registry::{ensure_identity, pull_secrets_for};
use super::resources::{
    create_deployment, create_headless_service, create_service, memory_resources,
    DeploymentParams,
};
use super::rollout::{rollback, RolloutMonitor};
use crate::config::Config;
use crate::error::{Error, MultiError, Result};
use crate::labels::{deployment_name, headless_service_name, service_account_name, LabelSet};
use crate::progress::Progress;
use crate::workload::Workload;

/// Request to roll out `image` as the units of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub workload: Workload,
    pub image: String,
    pub replicas: i32,
    /// Extra labels and annotations for the units.
    #[serde(default)]
    pub labels: Option<LabelSet>,
}

fn ignore_already_exists<T>(result: ClusterResult<T>) -> ClusterResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

fn collect_unless_not_found(errors: &mut MultiError, result: ClusterResult<()>) {
    if let Err(e) = result {
        if !e.is_not_found() {
            errors.push(e);
        }
    }
}

/// Manages the deployments and services of workload processes
pub struct ServiceManager<C: ?Sized> {
    cluster: Arc<C>,
    config: Arc<Config>,
}

impl<C> Clone for ServiceManager<C>
where
    C: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C> ServiceManager<C>
where
    C: ClusterApi + ?Sized,
{
    pub fn new(cluster: Arc<C>, config: Arc<Config>) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Roll out `request.image` for `process`, rolling back on failure and
    /// exposing the units once they have converged.
    #[instrument(skip(self, request, progress), fields(app = %request.workload.name, image = %request.image))]
    pub async fn deploy_service(
        &self,
        process: &str,
        request: &DeployRequest,
        progress: &Progress,
    ) -> Result<()> {
        let cluster = self.cluster.as_ref();
        let config = self.config.as_ref();
        let workload = &request.workload;
        let app = workload.name.as_str();
        let declared = workload.process(process)?;
        let port = declared.port.unwrap_or(config.web_port);
        let probe = match (&declared.healthcheck, workload.web_process_name()) {
            (Some(hc), Some(web)) if web == process => hc.to_probe(port)?,
            _ => None,
        };
        let overcommit = config.overcommit_factor(&workload.pool)?;

        ensure_identity(cluster, app).await?;

        let name = deployment_name(app, process);
        let exists = match cluster.get_deployment(&name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        let mut labels = LabelSet::for_process(app, process, &workload.pool);
        if let Some(extra) = &request.labels {
            labels.extend(extra);
        }

        let pull_secrets = pull_secrets_for(cluster, config, &[request.image.as_str()]).await?;
        let headless = headless_service_name(app, process);
        let service_account = service_account_name(app);

        let desired = create_deployment(DeploymentParams {
            name: &name,
            namespace: cluster.namespace(),
            labels: &labels,
            pool: &workload.pool,
            replicas: request.replicas,
            image: &request.image,
            command: declared.command.clone(),
            env: workload.env_vars(),
            port,
            probe,
            resources: memory_resources(workload.memory, overcommit),
            pull_secrets,
            service_account: &service_account,
            run_as_user: config.run_as_user,
            subdomain: &headless,
        });

        let mut monitor = RolloutMonitor::new(cluster, config, progress, process, &labels);
        let applied = monitor.apply(&desired, exists).await?;

        if let Err(err) = monitor.monitor(applied).await {
            metrics::increment_counter!("kubeship_rollouts_total", "result" => "failure");
            warn!(deployment = %name, error = %err, "Rollout failed, rolling back");
            progress.write(format!(
                "\n**** ROLLING BACK AFTER FAILURE ****\n ---> {err} <---\n"
            ));
            let rollback_err = match rollback(cluster, &name).await {
                Ok(_) => {
                    metrics::increment_counter!("kubeship_rollbacks_total", "result" => "success");
                    None
                }
                Err(e) => {
                    metrics::increment_counter!("kubeship_rollbacks_total", "result" => "failure");
                    progress.write(format!(
                        "\n**** ERROR DURING ROLLBACK ****\n ---> {e} <---\n"
                    ));
                    Some(Box::new(e))
                }
            };
            return Err(Error::UnitStartup {
                source: Box::new(err),
                rollback: rollback_err,
            });
        }
        metrics::increment_counter!("kubeship_rollouts_total", "result" => "success");

        self.expose_services(&name, &headless, &labels, port).await?;
        info!(deployment = %name, "Process deployed");
        Ok(())
    }

    /// Create the load-balanced and headless services for a process.
    /// Services that already exist are left as they are.
    pub async fn expose_services(
        &self,
        name: &str,
        headless_name: &str,
        labels: &LabelSet,
        target_port: u16,
    ) -> Result<()> {
        let cluster = self.cluster.as_ref();
        let port = self.config.web_port;

        let service = create_service(name, cluster.namespace(), labels, port, target_port);
        ignore_already_exists(cluster.create_service(&service).await)?;

        let headless =
            create_headless_service(headless_name, cluster.namespace(), labels, port, target_port);
        ignore_already_exists(cluster.create_service(&headless).await)?;
        Ok(())
    }

    /// Delete the deployment and both services of a process. Objects that
    /// are already gone are skipped; every other failure is reported.
    #[instrument(skip(self))]
    pub async fn remove_service(&self, app: &str, process: &str) -> Result<()> {
        let cluster = self.cluster.as_ref();
        let name = deployment_name(app, process);
        let mut errors = MultiError::new();

        collect_unless_not_found(&mut errors, cluster.delete_deployment(&name).await);
        collect_unless_not_found(&mut errors, cluster.delete_service(&name).await);
        collect_unless_not_found(
            &mut errors,
            cluster
                .delete_service(&headless_service_name(app, process))
                .await,
        );

        if errors.is_empty() {
            info!(deployment = %name, "Process removed");
        }
        errors.into_result()
    }

    /// Labels of the units currently deployed for a process, `None` when
    /// there is no deployment.
    pub async fn current_labels(&self, app: &str, process: &str) -> Result<Option<LabelSet>> {
        let name = deployment_name(app, process);
        match self.cluster.get_deployment(&name).await {
            Ok(dep) => Ok(dep
                .spec
                .and_then(|s| s.template.metadata)
                .map(|meta| LabelSet::from_meta(&meta))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
