//! Kubernetes resource builders
//!
//! Pure functions turning provisioning parameters into API objects. Nothing
//! here talks to the cluster.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource,
    LocalObjectReference, Pod, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Secret, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde_json::json;

use crate::labels::{LabelSet, NODE_POOL_LABEL};

pub const DOCKER_SOCK_PATH: &str = "/var/run/docker.sock";
pub const INTERCONTAINER_PATH: &str = "/tmp/intercontainer";

const DOCKER_SOCK_VOLUME: &str = "dockersock";
const INTERCONTAINER_VOLUME: &str = "intercontainer";
const SENTINEL_POLL_INTERVAL_SECS: u32 = 5;
const REVISION_HISTORY_LIMIT: i32 = 10;
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Completion handshake between the two containers of a sidecar pod.
///
/// The signal has two states: pending while the sentinel file is absent and
/// done once it exists. The target container blocks while pending; the
/// sidecar moves it to done when its work exits, whether it succeeded or not.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    dir: &'static str,
}

impl Handshake {
    pub const fn new() -> Self {
        Self {
            dir: INTERCONTAINER_PATH,
        }
    }

    pub fn dir(&self) -> &str {
        self.dir
    }

    pub fn sentinel_path(&self) -> String {
        format!("{}/done", self.dir)
    }

    /// Command for the target container: poll until the signal is done.
    pub fn wait_command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-ec".to_string(),
            format!(
                "while [ ! -f {} ]; do sleep {}; done",
                self.sentinel_path(),
                SENTINEL_POLL_INTERVAL_SECS
            ),
        ]
    }

    /// Wrap `script` so the signal is set on every exit path of the sidecar.
    pub fn signal_on_exit(&self, script: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-ec".to_string(),
            format!(
                "end() {{ touch {}; }}\ntrap end EXIT\n{}\n",
                self.sentinel_path(),
                script
            ),
        ]
    }

    fn mount(&self) -> VolumeMount {
        VolumeMount {
            name: INTERCONTAINER_VOLUME.to_string(),
            mount_path: self.dir.to_string(),
            ..Default::default()
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Parameters for a two-container sidecar pod.
#[derive(Debug, Clone)]
pub struct SidecarPodParams<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub labels: &'a LabelSet,
    pub pool: &'a str,
    pub service_account: &'a str,
    pub pull_secrets: Vec<LocalObjectReference>,
    pub source_image: &'a str,
    pub target_env: Vec<EnvVar>,
    pub run_as_user: Option<i64>,
    pub sidecar_container: &'a str,
    pub sidecar_image: &'a str,
    pub sidecar_env: Vec<EnvVar>,
    /// Sidecar work, run under the exit handshake.
    pub sidecar_script: String,
}

/// Build a non-restarting pod with a target container parked on the
/// handshake and a privileged sidecar with access to the container engine.
pub fn create_sidecar_pod(params: SidecarPodParams<'_>) -> Pod {
    let handshake = Handshake::new();

    let volumes = vec![
        Volume {
            name: DOCKER_SOCK_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: DOCKER_SOCK_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: INTERCONTAINER_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    let target = Container {
        name: params.name.to_string(),
        image: Some(params.source_image.to_string()),
        command: Some(handshake.wait_command()),
        env: (!params.target_env.is_empty()).then_some(params.target_env),
        security_context: params.run_as_user.map(|uid| SecurityContext {
            run_as_user: Some(uid),
            ..Default::default()
        }),
        volume_mounts: Some(vec![handshake.mount()]),
        ..Default::default()
    };

    let sidecar = Container {
        name: params.sidecar_container.to_string(),
        image: Some(params.sidecar_image.to_string()),
        command: Some(handshake.signal_on_exit(&params.sidecar_script)),
        env: Some(params.sidecar_env),
        stdin: Some(true),
        stdin_once: Some(true),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DOCKER_SOCK_VOLUME.to_string(),
                mount_path: DOCKER_SOCK_PATH.to_string(),
                ..Default::default()
            },
            handshake.mount(),
        ]),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(params.name.to_string()),
            namespace: Some(params.namespace.to_string()),
            labels: Some(params.labels.to_labels()),
            annotations: Some(params.labels.to_annotations()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            image_pull_secrets: (!params.pull_secrets.is_empty()).then_some(params.pull_secrets),
            service_account_name: Some(params.service_account.to_string()),
            node_selector: Some(pool_selector(params.pool)),
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            containers: vec![target, sidecar],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pool_selector(pool: &str) -> BTreeMap<String, String> {
    [(NODE_POOL_LABEL.to_string(), pool.to_string())]
        .into_iter()
        .collect()
}

/// Memory limit and request. The request is the limit divided by the
/// pool's overcommit factor, which callers validate to be non-zero.
pub fn memory_resources(memory: i64, overcommit: u64) -> ResourceRequirements {
    if memory <= 0 {
        return ResourceRequirements::default();
    }
    let request = memory / overcommit.max(1) as i64;
    ResourceRequirements {
        limits: Some(
            [("memory".to_string(), Quantity(memory.to_string()))]
                .into_iter()
                .collect(),
        ),
        requests: Some(
            [("memory".to_string(), Quantity(request.to_string()))]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

/// Parameters for a workload process deployment.
#[derive(Debug, Clone)]
pub struct DeploymentParams<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub labels: &'a LabelSet,
    pub pool: &'a str,
    pub replicas: i32,
    pub image: &'a str,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub port: u16,
    pub probe: Option<Probe>,
    pub resources: ResourceRequirements,
    pub pull_secrets: Vec<LocalObjectReference>,
    pub service_account: &'a str,
    pub run_as_user: Option<i64>,
    /// Headless service the pods register under.
    pub subdomain: &'a str,
}

/// Build a deployment that rolls out by surging a full new replica set
/// (100% surge, 0 unavailable) so capacity never drops during a rollout.
pub fn create_deployment(params: DeploymentParams<'_>) -> Deployment {
    let container = Container {
        name: params.name.to_string(),
        image: Some(params.image.to_string()),
        command: (!params.command.is_empty()).then_some(params.command),
        env: (!params.env.is_empty()).then_some(params.env),
        readiness_probe: params.probe.clone(),
        liveness_probe: params.probe,
        resources: Some(params.resources),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(params.port),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(params.name.to_string()),
            namespace: Some(params.namespace.to_string()),
            labels: Some(params.labels.to_labels()),
            annotations: Some(params.labels.to_annotations()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(params.replicas),
            revision_history_limit: Some(REVISION_HISTORY_LIMIT),
            selector: LabelSelector {
                match_labels: Some(params.labels.to_selector()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("100%".to_string())),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(params.labels.to_labels()),
                    annotations: Some(params.labels.to_annotations()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    image_pull_secrets: (!params.pull_secrets.is_empty())
                        .then_some(params.pull_secrets),
                    service_account_name: Some(params.service_account.to_string()),
                    security_context: params.run_as_user.map(|uid| PodSecurityContext {
                        run_as_user: Some(uid),
                        ..Default::default()
                    }),
                    restart_policy: Some("Always".to_string()),
                    node_selector: Some(pool_selector(params.pool)),
                    subdomain: Some(params.subdomain.to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(port: u16, target_port: u16) -> ServicePort {
    ServicePort {
        protocol: Some("TCP".to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(target_port))),
        ..Default::default()
    }
}

/// Externally reachable service load-balancing over the process units.
pub fn create_service(
    name: &str,
    namespace: &str,
    labels: &LabelSet,
    port: u16,
    target_port: u16,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.to_labels()),
            annotations: Some(labels.to_annotations()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels.to_selector()),
            ports: Some(vec![service_port(port, target_port)]),
            type_: Some("NodePort".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless service giving each unit its own DNS record.
pub fn create_headless_service(
    name: &str,
    namespace: &str,
    labels: &LabelSet,
    port: u16,
    target_port: u16,
) -> Service {
    let mut labels = labels.clone();
    labels.set_is_headless_service();
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.to_labels()),
            annotations: Some(labels.to_annotations()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels.to_selector()),
            ports: Some(vec![service_port(port, target_port)]),
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn create_service_account(name: &str, namespace: &str, labels: &LabelSet) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.to_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Docker config secret holding credentials for `registry`.
pub fn create_registry_secret(
    name: &str,
    namespace: &str,
    registry: &str,
    username: &str,
    password: &str,
) -> Result<Secret, serde_json::Error> {
    let auth = BASE64.encode(format!("{username}:{password}"));
    let conf = json!({
        "auths": {
            registry: {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    });
    let data = serde_json::to_vec(&conf)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            [(DOCKER_CONFIG_JSON_KEY.to_string(), ByteString(data))]
                .into_iter()
                .collect(),
        ),
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar_params(labels: &LabelSet) -> SidecarPodParams<'_> {
        SidecarPodParams {
            name: "myapp-v1-build",
            namespace: "kubeship",
            labels,
            pool: "default",
            service_account: "app-myapp",
            pull_secrets: Vec::new(),
            source_image: "python:3.12",
            target_env: vec![env("PORT", "8888")],
            run_as_user: Some(1000),
            sidecar_container: "committer-cont",
            sidecar_image: "kubeship/deploy-agent:latest",
            sidecar_env: vec![env("KUBESHIP_AGENT_RUN_AS_SIDECAR", "true")],
            sidecar_script: "/bin/deploy-agent".to_string(),
        }
    }

    #[test]
    fn test_sidecar_pod_has_two_containers_sharing_the_handshake() {
        let labels = LabelSet::for_build("myapp", "default");
        let pod = create_sidecar_pod(sidecar_params(&labels));

        assert_eq!(pod.metadata.name.as_deref(), Some("myapp-v1-build"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 2);

        let mount_of = |c: &Container| {
            c.volume_mounts
                .as_ref()
                .unwrap()
                .iter()
                .find(|m| m.name == INTERCONTAINER_VOLUME)
                .map(|m| m.mount_path.clone())
        };
        assert_eq!(mount_of(&spec.containers[0]), Some(INTERCONTAINER_PATH.to_string()));
        assert_eq!(mount_of(&spec.containers[0]), mount_of(&spec.containers[1]));

        let target_cmd = spec.containers[0].command.as_ref().unwrap().join(" ");
        assert!(target_cmd.contains("/tmp/intercontainer/done"));
        assert!(target_cmd.contains("sleep 5"));

        let sidecar_cmd = spec.containers[1].command.as_ref().unwrap().join(" ");
        assert!(sidecar_cmd.contains("trap end EXIT"));
        assert!(sidecar_cmd.contains("touch /tmp/intercontainer/done"));
        assert_eq!(spec.containers[1].stdin, Some(true));
        assert_eq!(spec.containers[1].stdin_once, Some(true));
    }

    #[test]
    fn test_only_sidecar_mounts_docker_socket() {
        let labels = LabelSet::for_build("myapp", "default");
        let spec = create_sidecar_pod(sidecar_params(&labels)).spec.unwrap();
        let has_sock = |c: &Container| {
            c.volume_mounts
                .as_ref()
                .unwrap()
                .iter()
                .any(|m| m.mount_path == DOCKER_SOCK_PATH)
        };
        assert!(!has_sock(&spec.containers[0]));
        assert!(has_sock(&spec.containers[1]));
    }

    #[test]
    fn test_memory_resources_apply_overcommit() {
        let res = memory_resources(1024 * 1024 * 512, 2);
        assert_eq!(
            res.limits.unwrap().get("memory"),
            Some(&Quantity("536870912".to_string()))
        );
        assert_eq!(
            res.requests.unwrap().get("memory"),
            Some(&Quantity("268435456".to_string()))
        );
        assert!(memory_resources(0, 2).limits.is_none());
    }

    #[test]
    fn test_deployment_surges_without_unavailability() {
        let labels = LabelSet::for_process("myapp", "web", "default");
        let dep = create_deployment(DeploymentParams {
            name: "myapp-web",
            namespace: "kubeship",
            labels: &labels,
            pool: "default",
            replicas: 3,
            image: "registry.example.com/myapp:v2",
            command: vec!["python".to_string(), "app.py".to_string()],
            env: Vec::new(),
            port: 8888,
            probe: None,
            resources: ResourceRequirements::default(),
            pull_secrets: Vec::new(),
            service_account: "app-myapp",
            run_as_user: None,
            subdomain: "myapp-web-units",
        });

        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.revision_history_limit, Some(10));
        let rolling = spec.strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::String("100%".to_string())));
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(0)));
        assert_eq!(spec.selector.match_labels, Some(labels.to_selector()));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.subdomain.as_deref(), Some("myapp-web-units"));
        assert_eq!(pod.containers[0].ports.as_ref().unwrap()[0].container_port, 8888);
    }

    #[test]
    fn test_services_share_selector_but_not_labels() {
        let labels = LabelSet::for_process("myapp", "web", "default");
        let lb = create_service("myapp-web", "kubeship", &labels, 8888, 8000);
        let headless = create_headless_service("myapp-web-units", "kubeship", &labels, 8888, 8000);

        let lb_spec = lb.spec.unwrap();
        let headless_spec = headless.spec.unwrap();
        assert_eq!(lb_spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(headless_spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(lb_spec.selector, headless_spec.selector);
        assert_ne!(lb.metadata.labels, headless.metadata.labels);
        assert_eq!(
            lb_spec.ports.unwrap()[0].target_port,
            Some(IntOrString::Int(8000))
        );
    }

    #[test]
    fn test_registry_secret_payload() {
        let secret = create_registry_secret(
            "registry-registry-example-com",
            "kubeship",
            "registry.example.com",
            "user",
            "pass",
        )
        .unwrap();
        assert_eq!(secret.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
        let data = secret.data.unwrap();
        let raw = &data.get(DOCKER_CONFIG_JSON_KEY).unwrap().0;
        let conf: serde_json::Value = serde_json::from_slice(raw).unwrap();
        let entry = &conf["auths"]["registry.example.com"];
        assert_eq!(entry["username"], "user");
        assert_eq!(entry["auth"], BASE64.encode("user:pass"));
    }
}
