//! Label, annotation and object-name conventions for provisioned objects

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const LABEL_PREFIX: &str = "kubeship.io/";

const LABEL_APP: &str = "kubeship.io/app";
const LABEL_PROCESS: &str = "kubeship.io/process";
const LABEL_POOL: &str = "kubeship.io/pool";
const LABEL_IS_BUILD: &str = "kubeship.io/is-build";
const LABEL_IS_HEADLESS: &str = "kubeship.io/is-headless-service";
const LABEL_IS_SERVICE_ACCOUNT: &str = "kubeship.io/is-service-account";
const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const ANNOTATION_BUILD_IMAGE: &str = "kubeship.io/build-image";

/// Node label used to pin workloads to their pool.
pub const NODE_POOL_LABEL: &str = "kubeship.io/pool";

/// Max length of a DNS-1123 label, which pod and service names must satisfy.
const MAX_NAME_LEN: usize = 63;

/// Labels and annotations attached to a provisioned object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl LabelSet {
    /// Labels for the units of a workload process.
    pub fn for_process(app: &str, process: &str, pool: &str) -> Self {
        let mut set = Self::base(app, pool);
        set.labels
            .insert(LABEL_PROCESS.to_string(), process.to_string());
        set.labels
            .insert(LABEL_IS_BUILD.to_string(), "false".to_string());
        set
    }

    /// Labels for the build and inspect pods of a workload.
    pub fn for_build(app: &str, pool: &str) -> Self {
        let mut set = Self::base(app, pool);
        set.labels
            .insert(LABEL_IS_BUILD.to_string(), "true".to_string());
        set
    }

    pub fn for_service_account(app: &str) -> Self {
        let mut set = Self::default();
        set.labels.insert(LABEL_APP.to_string(), app.to_string());
        set.labels
            .insert(LABEL_IS_SERVICE_ACCOUNT.to_string(), "true".to_string());
        set.labels
            .insert(LABEL_MANAGED_BY.to_string(), "kubeship".to_string());
        set
    }

    fn base(app: &str, pool: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP.to_string(), app.to_string());
        labels.insert(LABEL_POOL.to_string(), pool.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), "kubeship".to_string());
        Self {
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Rebuild a label set from an existing object's metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
        }
    }

    /// Merge caller-provided labels without overriding the ownership keys.
    pub fn extend(&mut self, other: &LabelSet) {
        for (k, v) in &other.labels {
            self.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &other.annotations {
            self.annotations.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn to_labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }

    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        self.annotations.clone()
    }

    /// Subset of labels that identifies the units of one process.
    pub fn to_selector(&self) -> BTreeMap<String, String> {
        [LABEL_APP, LABEL_PROCESS, LABEL_IS_BUILD]
            .iter()
            .filter_map(|k| self.labels.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    /// Selector rendered as `k=v,k=v` for list calls.
    pub fn selector_string(&self) -> String {
        selector_string(&self.to_selector())
    }

    pub fn set_is_headless_service(&mut self) {
        self.labels
            .insert(LABEL_IS_HEADLESS.to_string(), "true".to_string());
    }

    pub fn is_headless_service(&self) -> bool {
        self.labels.get(LABEL_IS_HEADLESS).map(String::as_str) == Some("true")
    }

    pub fn set_build_image(&mut self, image: &str) {
        self.annotations
            .insert(ANNOTATION_BUILD_IMAGE.to_string(), image.to_string());
    }

    pub fn build_image(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_BUILD_IMAGE).map(String::as_str)
    }

    pub fn app_name(&self) -> Option<&str> {
        self.labels.get(LABEL_APP).map(String::as_str)
    }

    pub fn process_name(&self) -> Option<&str> {
        self.labels.get(LABEL_PROCESS).map(String::as_str)
    }
}

pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Lowercase, replace anything outside `[a-z0-9-]` and cap at 63 chars.
pub fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if name.len() > MAX_NAME_LEN {
        name.truncate(MAX_NAME_LEN);
    }
    name.trim_matches('-').to_string()
}

pub fn deployment_name(app: &str, process: &str) -> String {
    sanitize_name(&format!("{app}-{process}"))
}

/// Headless service name. The `-units` suffix keeps it distinct from the
/// load-balanced service, which is named after the deployment.
pub fn headless_service_name(app: &str, process: &str) -> String {
    let base = deployment_name(app, process);
    let base = &base[..base.len().min(MAX_NAME_LEN - "-units".len())];
    format!("{}-units", base.trim_end_matches('-'))
}

pub fn service_account_name(app: &str) -> String {
    sanitize_name(&format!("app-{app}"))
}

pub fn build_pod_name(app: &str, version: &str) -> String {
    sanitize_name(&format!("{app}-{version}-build"))
}

pub fn deploy_pod_name(app: &str, version: &str) -> String {
    sanitize_name(&format!("{app}-{version}-deploy"))
}

pub fn registry_secret_name(registry: &str) -> String {
    sanitize_name(&format!("registry-{registry}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_labels_and_selector() {
        let labels = LabelSet::for_process("myapp", "web", "default");
        assert_eq!(labels.app_name(), Some("myapp"));
        assert_eq!(labels.process_name(), Some("web"));

        let selector = labels.to_selector();
        assert_eq!(selector.len(), 3);
        assert!(!selector.contains_key(LABEL_POOL));
        assert_eq!(
            labels.selector_string(),
            "kubeship.io/app=myapp,kubeship.io/is-build=false,kubeship.io/process=web"
        );
    }

    #[test]
    fn test_headless_label_does_not_change_selector() {
        let mut labels = LabelSet::for_process("myapp", "web", "default");
        let before = labels.to_selector();
        labels.set_is_headless_service();
        assert!(labels.is_headless_service());
        assert_eq!(labels.to_selector(), before);
    }

    #[test]
    fn test_extend_keeps_ownership_keys() {
        let mut labels = LabelSet::for_process("myapp", "web", "default");
        let mut extra = LabelSet::default();
        extra
            .labels
            .insert(LABEL_APP.to_string(), "other".to_string());
        extra.labels.insert("team".to_string(), "core".to_string());
        labels.extend(&extra);
        assert_eq!(labels.app_name(), Some("myapp"));
        assert_eq!(labels.labels.get("team"), Some(&"core".to_string()));
    }

    #[test]
    fn test_names_never_collide() {
        let dep = deployment_name("myapp", "web");
        let headless = headless_service_name("myapp", "web");
        assert_eq!(dep, "myapp-web");
        assert_eq!(headless, "myapp-web-units");

        let long = "a".repeat(80);
        let dep = deployment_name(&long, "web");
        let headless = headless_service_name(&long, "web");
        assert!(dep.len() <= 63);
        assert!(headless.len() <= 63);
        assert_ne!(dep, headless);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My_App.v2"), "my-app-v2");
        assert_eq!(registry_secret_name("registry.example.com:5000"), "registry-registry-example-com-5000");
        assert_eq!(build_pod_name("myapp", "v3"), "myapp-v3-build");
    }
}
