//! Sidecar execution pipeline
//!
//! Build, archive deploy and inspect work runs inside a two-container pod:
//! the target container holds the source image and blocks on the exit
//! handshake, the sidecar runs the deploy agent with access to the container
//! engine. The caller's input goes into the sidecar through an attach
//! session. The attach session closes together with stdin, so everything the
//! sidecar prints is read from its log instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EnvVar, Pod};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use super::cluster::{AttachStreams, ClusterApi};
use super::pods::{cleanup_pod, wait_for_pod, wait_for_pod_containers_running};
use super::registry::{ensure_identity, image_domain, pull_secrets_for};
use super::resources::{create_sidecar_pod, env, SidecarPodParams};
use super::watcher::{watch_events, EventPrinter, POD_KIND};
use crate::config::Config;
use crate::error::{Error, MultiError, Result, TimeoutError, TimeoutPhase};
use crate::labels::{build_pod_name, deploy_pod_name, service_account_name, LabelSet};
use crate::progress::Progress;
use crate::workload::Workload;

pub const BUILD_CONTAINER: &str = "committer-cont";
pub const INSPECT_CONTAINER: &str = "inspect-cont";

const BUILD_COMMAND_STEPS: usize = 3;
const INSPECT_SCRIPT: &str = "cat >/dev/null && /bin/deploy-agent";

const AGENT_RUN_AS_SIDECAR: &str = "KUBESHIP_AGENT_RUN_AS_SIDECAR";
const AGENT_DESTINATION_IMAGES: &str = "KUBESHIP_AGENT_DESTINATION_IMAGES";
const AGENT_SOURCE_IMAGE: &str = "KUBESHIP_AGENT_SOURCE_IMAGE";
const AGENT_INPUT_FILE: &str = "KUBESHIP_AGENT_INPUT_FILE";
const AGENT_RUN_AS_USER: &str = "KUBESHIP_AGENT_RUN_AS_USER";
const AGENT_REGISTRY_USER: &str = "KUBESHIP_AGENT_REGISTRY_AUTH_USER";
const AGENT_REGISTRY_PASS: &str = "KUBESHIP_AGENT_REGISTRY_AUTH_PASS";
const AGENT_REGISTRY_ADDRESS: &str = "KUBESHIP_AGENT_REGISTRY_ADDRESS";

/// Produce a new image from a source archive, either as a build or as an
/// archive deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub workload: Workload,
    pub version: String,
    /// Base image the archive is built on.
    pub source_image: String,
    pub destination_images: Vec<String>,
    /// Download, extract and build (or deploy) steps, in that order.
    pub commands: Vec<String>,
    /// Path inside the sidecar the streamed input is written to.
    pub input_file: String,
}

/// Retag and push an existing image, extracting its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectRequest {
    pub workload: Workload,
    pub version: String,
    pub source_image: String,
    pub destination_images: Vec<String>,
}

/// Subset of the container engine's image inspect document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub config: Option<ImageConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Payload the inspect agent writes to its stdout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectResult {
    pub image: ImageDescriptor,
    /// Free-form metadata document shipped inside the image.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub processes: BTreeMap<String, Vec<String>>,
}

/// Split `image` into repository and tag, defaulting the tag to `latest`.
pub fn split_image_name(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Destination list with `<repository>:latest` appended when the first
/// destination carries another tag.
pub fn with_latest_tag(destinations: &[String]) -> Vec<String> {
    let mut out = destinations.to_vec();
    if let Some(first) = destinations.first() {
        let (repository, tag) = split_image_name(first);
        if tag != "latest" {
            out.push(format!("{repository}:latest"));
        }
    }
    out
}

/// Decode the inspect agent's payload. The sidecar log may carry progress
/// lines ahead of the document, in which case the last line is taken.
pub fn decode_inspect_output(raw: &[u8]) -> Result<InspectResult> {
    serde_json::from_slice(raw).or_else(|source| {
        let last = raw
            .split(|b| *b == b'\n')
            .rev()
            .find(|line| !line.iter().all(u8::is_ascii_whitespace));
        match last {
            Some(line) if line.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') => {
                serde_json::from_slice(line).map_err(|source| Error::InvalidInspectResponse {
                    raw: String::from_utf8_lossy(raw).into_owned(),
                    source,
                })
            }
            _ => Err(Error::InvalidInspectResponse {
                raw: String::from_utf8_lossy(raw).into_owned(),
                source,
            }),
        }
    })
}

/// Sidecar runs fed with a source archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum ArchiveRun {
    /// Build pod named after the version; kept for its logs.
    Build,
    /// Deploy pod; destinations get a `latest` tag as well.
    Deploy,
}

fn outcome<T>(result: &Result<T>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "failure"
    }
}

/// One sidecar pod run, independent of the variant.
struct PodRun<'a> {
    pod: Pod,
    name: &'a str,
    container: &'a str,
    input: Option<&'a mut (dyn AsyncRead + Send + Unpin)>,
    /// Receives the sidecar's log.
    output: &'a mut (dyn AsyncWrite + Send + Unpin),
    /// Attach and read the log even when the containers never reported
    /// running, reporting every failure together.
    attach_when_stalled: bool,
}

/// Runs build, archive deploy and inspect sidecar pods against a cluster.
pub struct SidecarRunner<C: ?Sized> {
    cluster: Arc<C>,
    config: Arc<Config>,
}

impl<C> Clone for SidecarRunner<C>
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

impl<C> SidecarRunner<C>
where
    C: ClusterApi + ?Sized,
{
    pub fn new(cluster: Arc<C>, config: Arc<Config>) -> Self {
        Self { cluster, config }
    }

    /// Build a new image from the archive read from `input`. The build pod
    /// is left in place afterwards so its logs stay available.
    #[instrument(skip(self, request, input, progress), fields(app = %request.workload.name, version = %request.version))]
    pub async fn build(
        &self,
        request: &BuildRequest,
        input: Option<&mut (dyn AsyncRead + Send + Unpin)>,
        progress: &Progress,
    ) -> Result<()> {
        self.run_archive(ArchiveRun::Build, request, input, progress)
            .await
    }

    /// Deploy straight from the archive read from `input`, pushing the
    /// result under every destination plus `latest`.
    #[instrument(skip(self, request, input, progress), fields(app = %request.workload.name, version = %request.version))]
    pub async fn deploy(
        &self,
        request: &BuildRequest,
        input: Option<&mut (dyn AsyncRead + Send + Unpin)>,
        progress: &Progress,
    ) -> Result<()> {
        self.run_archive(ArchiveRun::Deploy, request, input, progress)
            .await
    }

    async fn run_archive(
        &self,
        kind: ArchiveRun,
        request: &BuildRequest,
        input: Option<&mut (dyn AsyncRead + Send + Unpin)>,
        progress: &Progress,
    ) -> Result<()> {
        let result = self.run_archive_pod(kind, request, input, progress).await;
        metrics::increment_counter!(
            "kubeship_sidecar_runs_total",
            "variant" => kind.to_string(),
            "result" => outcome(&result)
        );
        result
    }

    async fn run_archive_pod(
        &self,
        kind: ArchiveRun,
        request: &BuildRequest,
        input: Option<&mut (dyn AsyncRead + Send + Unpin)>,
        progress: &Progress,
    ) -> Result<()> {
        if request.destination_images.is_empty() {
            return Err(Error::precondition("no destination images provided"));
        }
        if request.commands.len() != BUILD_COMMAND_STEPS {
            return Err(Error::precondition(format!(
                "unexpected {kind} commands: expected {BUILD_COMMAND_STEPS} (download, extract, {kind}), got {}",
                request.commands.len()
            )));
        }

        let workload = &request.workload;
        let (name, destinations) = match kind {
            ArchiveRun::Build => (
                build_pod_name(&workload.name, &request.version),
                request.destination_images.clone(),
            ),
            ArchiveRun::Deploy => (
                deploy_pod_name(&workload.name, &request.version),
                with_latest_tag(&request.destination_images),
            ),
        };
        let mut labels = LabelSet::for_build(&workload.name, &workload.pool);
        labels.set_build_image(&destinations[0]);

        let script = format!(
            "mkdir -p $(dirname {input}) && cat >{input} && {cmds}",
            input = request.input_file,
            cmds = request.commands.join(" && "),
        );
        let sidecar_env = self.sidecar_env(&destinations, &request.input_file);

        let pod = self
            .compose_pod(
                &name,
                BUILD_CONTAINER,
                &labels,
                workload,
                &request.source_image,
                &self.config.deploy_sidecar_image,
                workload.env_vars(),
                sidecar_env,
                script,
            )
            .await?;

        let mut output = progress.writer();
        self.run_pod(
            PodRun {
                pod,
                name: &name,
                container: BUILD_CONTAINER,
                input: match input {
                    Some(input) => Some(input),
                    None => None,
                },
                output: &mut output,
                attach_when_stalled: false,
            },
            progress,
        )
        .await
    }

    /// Pull `source_image`, push it under every destination (plus `latest`)
    /// and return what the agent found inside it. The inspect pod is always
    /// removed.
    #[instrument(skip(self, request, progress), fields(app = %request.workload.name, image = %request.source_image))]
    pub async fn inspect(
        &self,
        request: &InspectRequest,
        progress: &Progress,
    ) -> Result<InspectResult> {
        let result = self.run_inspect(request, progress).await;
        metrics::increment_counter!(
            "kubeship_sidecar_runs_total",
            "variant" => "inspect",
            "result" => outcome(&result)
        );
        result
    }

    async fn run_inspect(
        &self,
        request: &InspectRequest,
        progress: &Progress,
    ) -> Result<InspectResult> {
        if request.destination_images.is_empty() {
            return Err(Error::precondition("no destination images provided"));
        }
        let destinations = with_latest_tag(&request.destination_images);

        let workload = &request.workload;
        let name = deploy_pod_name(&workload.name, &request.version);
        let labels = LabelSet::for_build(&workload.name, &workload.pool);

        let mut sidecar_env = self.sidecar_env(&destinations, "");
        sidecar_env.push(env(AGENT_SOURCE_IMAGE, request.source_image.clone()));

        let pod = self
            .compose_pod(
                &name,
                INSPECT_CONTAINER,
                &labels,
                workload,
                &request.source_image,
                &self.config.deploy_inspect_image,
                Vec::new(),
                sidecar_env,
                INSPECT_SCRIPT.to_string(),
            )
            .await?;

        let mut output: Vec<u8> = Vec::new();
        let mut dot: &[u8] = b".";
        let run = self
            .run_pod(
                PodRun {
                    pod,
                    name: &name,
                    container: INSPECT_CONTAINER,
                    input: Some(&mut dot),
                    output: &mut output,
                    attach_when_stalled: true,
                },
                progress,
            )
            .await;

        if let Err(e) = cleanup_pod(self.cluster.as_ref(), &name).await {
            warn!(pod = %name, error = %e, "Failed to remove inspect pod");
        }

        if let Err(source) = run {
            return Err(Error::Inspect {
                output: String::from_utf8_lossy(&output).into_owned(),
                source: Box::new(source),
            });
        }

        decode_inspect_output(&output)
    }

    fn sidecar_env(&self, destinations: &[String], input_file: &str) -> Vec<EnvVar> {
        let (user, pass, address) = match self.config.registry_credentials() {
            Some((registry, user, pass))
                if destinations
                    .first()
                    .is_some_and(|d| image_domain(d) == registry) =>
            {
                (user, pass, registry)
            }
            _ => ("", "", ""),
        };
        vec![
            env(AGENT_RUN_AS_SIDECAR, "true"),
            env(AGENT_DESTINATION_IMAGES, destinations.join(",")),
            env(AGENT_INPUT_FILE, input_file),
            env(
                AGENT_RUN_AS_USER,
                self.config
                    .run_as_user
                    .map(|uid| uid.to_string())
                    .unwrap_or_default(),
            ),
            env(AGENT_REGISTRY_USER, user),
            env(AGENT_REGISTRY_PASS, pass),
            env(AGENT_REGISTRY_ADDRESS, address),
        ]
    }

    #[allow(clippy::too_many_arguments)]
    async fn compose_pod(
        &self,
        name: &str,
        container: &str,
        labels: &LabelSet,
        workload: &Workload,
        source_image: &str,
        sidecar_image: &str,
        target_env: Vec<EnvVar>,
        sidecar_env: Vec<EnvVar>,
        script: String,
    ) -> Result<Pod> {
        let cluster = self.cluster.as_ref();
        ensure_identity(cluster, &workload.name).await?;
        let pull_secrets =
            pull_secrets_for(cluster, &self.config, &[source_image, sidecar_image]).await?;
        let service_account = service_account_name(&workload.name);

        Ok(create_sidecar_pod(SidecarPodParams {
            name,
            namespace: cluster.namespace(),
            labels,
            pool: &workload.pool,
            service_account: &service_account,
            pull_secrets,
            source_image,
            target_env,
            run_as_user: self.config.run_as_user,
            sidecar_container: container,
            sidecar_image,
            sidecar_env,
            sidecar_script: script,
        }))
    }

    /// Create the pod and drive it to completion while relaying its events.
    /// The event printer is stopped on every path out of here.
    async fn run_pod(&self, run: PodRun<'_>, progress: &Progress) -> Result<()> {
        let cluster = self.cluster.as_ref();
        let resume_token = match cluster.events_resource_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "Unable to read events resource version");
                String::new()
            }
        };

        cluster.create_pod(&run.pod).await?;
        info!(pod = %run.name, "Created sidecar pod");

        let printer = self.start_printer(run.name, &resume_token, progress).await;
        let result = self.drive_pod(run, progress).await;
        if let Some(printer) = printer {
            printer.stop().await;
        }
        result
    }

    async fn start_printer(
        &self,
        pod: &str,
        resume_token: &str,
        progress: &Progress,
    ) -> Option<EventPrinter> {
        match watch_events(self.cluster.as_ref(), POD_KIND, Some(pod), resume_token).await {
            Ok(watch) => Some(watch.print_to(progress.clone(), true)),
            Err(e) => {
                warn!(pod, error = %e, "Pod events unavailable");
                None
            }
        }
    }

    /// Wait for the containers, then feed the input while following the
    /// sidecar log until the sidecar exits, then wait for the pod to finish.
    async fn drive_pod(&self, run: PodRun<'_>, progress: &Progress) -> Result<()> {
        let cluster = self.cluster.as_ref();
        let PodRun {
            name,
            container,
            input,
            output,
            attach_when_stalled,
            ..
        } = run;

        let mut errors = MultiError::new();
        let running =
            wait_for_pod_containers_running(cluster, name, self.config.pod_running_timeout()).await;
        if let Err(e) = running {
            if !attach_when_stalled {
                return Err(e);
            }
            warn!(pod = %name, error = %e, "Containers not running, attaching anyway");
            errors.push(e);
        }

        let feed = async {
            let Some(input) = input else {
                return Ok(());
            };
            let streams = AttachStreams {
                stdin: Some(input),
                stdout: None,
                stderr: None,
                tty: false,
            };
            cluster
                .attach(name, container, streams)
                .await
                .map_err(|source| Error::Attach {
                    pod: name.to_string(),
                    container: container.to_string(),
                    source,
                })?;
            progress.line(" ---> Cleaning up");
            Ok::<_, Error>(())
        };
        let log_timeout = self.config.pod_ready_timeout();
        let logs = async {
            match timeout(log_timeout, cluster.follow_logs(name, container, output)).await {
                Ok(result) => result.map_err(|source| Error::Logs {
                    pod: name.to_string(),
                    container: container.to_string(),
                    source,
                }),
                Err(_) => Err(TimeoutError::new(TimeoutPhase::PodReady, name, log_timeout).into()),
            }
        };
        // A failed attach leaves the sidecar blocked on its input, so the
        // log follow is dropped with it.
        if let Err(e) = tokio::try_join!(feed, logs) {
            errors.push(e);
        }
        if let Some(err) = errors.into_error() {
            return Err(err);
        }

        wait_for_pod(cluster, name, self.config.pod_ready_timeout()).await
    }
}
