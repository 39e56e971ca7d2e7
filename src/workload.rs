//! Workload model: an application and the processes it declares

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, HTTPGetAction, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_HEALTHCHECK_SCHEME: &str = "http";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    #[serde(default = "default_pool")]
    pub pool: String,
    /// Memory limit in bytes, 0 for unlimited.
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub processes: BTreeMap<String, Process>,
    /// Process serving HTTP traffic. Falls back to `web`, then to the only
    /// declared process.
    #[serde(default)]
    pub web_process: Option<String>,
}

fn default_pool() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub allowed_failures: i32,
}

impl Workload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: default_pool(),
            memory: 0,
            env: BTreeMap::new(),
            processes: BTreeMap::new(),
            web_process: None,
        }
    }

    pub fn with_process(mut self, name: impl Into<String>, process: Process) -> Self {
        self.processes.insert(name.into(), process);
        self
    }

    pub fn process(&self, name: &str) -> Result<&Process> {
        self.processes.get(name).ok_or_else(|| {
            Error::precondition(format!(
                "process {name:?} not declared by app {:?}",
                self.name
            ))
        })
    }

    pub fn web_process_name(&self) -> Option<&str> {
        if let Some(web) = &self.web_process {
            return Some(web);
        }
        if self.processes.contains_key("web") {
            return Some("web");
        }
        if self.processes.len() == 1 {
            return self.processes.keys().next().map(String::as_str);
        }
        None
    }

    pub fn env_vars(&self) -> Vec<EnvVar> {
        self.env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect()
    }
}

impl HealthCheck {
    /// HTTP probe for `port`. An empty path means no probe. Only GET can
    /// be expressed as an HTTP probe, any other method is rejected.
    pub fn to_probe(&self, port: u16) -> Result<Option<Probe>> {
        if self.path.is_empty() {
            return Ok(None);
        }
        let method = self.method.as_deref().unwrap_or("").to_uppercase();
        if !method.is_empty() && method != "GET" {
            return Err(Error::precondition(format!(
                "healthcheck: only GET method is supported, got {method:?}"
            )));
        }
        let scheme = self
            .scheme
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_HEALTHCHECK_SCHEME)
            .to_uppercase();

        Ok(Some(Probe {
            failure_threshold: (self.allowed_failures > 0).then_some(self.allowed_failures),
            http_get: Some(HTTPGetAction {
                path: Some(self.path.clone()),
                port: IntOrString::Int(i32::from(port)),
                scheme: Some(scheme),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }
}
