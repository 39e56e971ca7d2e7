use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Health check wait applied when `healthcheck_max_time_secs` is unset or zero.
pub const DEFAULT_HEALTHCHECK_MAX_TIME: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Private registry hostname. Images under this domain get pull secrets.
    #[serde(default)]
    pub registry: Option<String>,

    #[serde(default)]
    pub registry_username: Option<String>,

    #[serde(default)]
    pub registry_password: Option<String>,

    #[serde(default = "default_sidecar_image")]
    pub deploy_sidecar_image: String,

    #[serde(default = "default_sidecar_image")]
    pub deploy_inspect_image: String,

    #[serde(default = "default_timeout_secs")]
    pub pod_running_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub pod_ready_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub deployment_progress_timeout_secs: u64,

    #[serde(default)]
    pub healthcheck_max_time_secs: Option<u64>,

    /// Fallback overcommit factor for pools without an explicit entry.
    #[serde(default)]
    pub overcommit_factor: Option<u64>,

    #[serde(default)]
    pub pool_overcommit: HashMap<String, u64>,

    /// Numeric uid build containers run as.
    #[serde(default)]
    pub run_as_user: Option<i64>,

    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

fn default_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "kubeship".to_string()
}

fn default_sidecar_image() -> String {
    "kubeship/deploy-agent:latest".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_web_port() -> u16 {
    8888
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("kubeship").required(false))
            .add_source(config::Environment::with_prefix("KUBESHIP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn pod_running_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_running_timeout_secs)
    }

    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ready_timeout_secs)
    }

    pub fn deployment_progress_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_progress_timeout_secs)
    }

    pub fn healthcheck_max_time(&self) -> Duration {
        match self.healthcheck_max_time_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_HEALTHCHECK_MAX_TIME,
        }
    }

    /// Overcommit factor for `pool`. A missing or zero factor cannot be
    /// used as a divisor and is reported as a configuration error.
    pub fn overcommit_factor(&self, pool: &str) -> Result<u64> {
        let factor = self
            .pool_overcommit
            .get(pool)
            .copied()
            .or(self.overcommit_factor);
        match factor {
            Some(f) if f > 0 => Ok(f),
            Some(_) => Err(Error::Config(format!(
                "misconfigured cluster overcommit factor: zero factor for pool {pool:?}"
            ))),
            None => Err(Error::Config(format!(
                "misconfigured cluster overcommit factor: no factor set for pool {pool:?}"
            ))),
        }
    }

    /// Registry credentials, only when both the registry and at least one
    /// of username/password are configured.
    pub fn registry_credentials(&self) -> Option<(&str, &str, &str)> {
        let registry = self.registry.as_deref()?;
        let username = self.registry_username.as_deref().unwrap_or("");
        let password = self.registry_password.as_deref().unwrap_or("");
        if username.is_empty() && password.is_empty() {
            return None;
        }
        Some((registry, username, password))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            namespace: default_namespace(),
            registry: None,
            registry_username: None,
            registry_password: None,
            deploy_sidecar_image: default_sidecar_image(),
            deploy_inspect_image: default_sidecar_image(),
            pod_running_timeout_secs: default_timeout_secs(),
            pod_ready_timeout_secs: default_timeout_secs(),
            deployment_progress_timeout_secs: default_timeout_secs(),
            healthcheck_max_time_secs: None,
            overcommit_factor: None,
            pool_overcommit: HashMap::new(),
            run_as_user: None,
            web_port: default_web_port(),
        }
    }
}
