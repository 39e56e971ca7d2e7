//! Registry credentials and workload identity
//!
//! Both objects must exist before any pod referencing them is created. They
//! are provisioned idempotently so every pipeline can call these helpers
//! unconditionally.

use k8s_openapi::api::core::v1::LocalObjectReference;
use tracing::{debug, info};

use super::cluster::ClusterApi;
use super::resources::{create_registry_secret, create_service_account};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::labels::{registry_secret_name, service_account_name, LabelSet};

/// Registry host of an image reference: everything before the first `/`.
pub fn image_domain(image: &str) -> &str {
    image.split('/').next().unwrap_or_default()
}

/// Ensure the service account pods of `app` run as. An existing account is
/// left untouched.
pub async fn ensure_identity<C>(cluster: &C, app: &str) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    let name = service_account_name(app);
    let account = create_service_account(
        &name,
        cluster.namespace(),
        &LabelSet::for_service_account(app),
    );
    match cluster.create_service_account(&account).await {
        Ok(_) => {
            info!(service_account = %name, "Created service account");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(service_account = %name, "Service account already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Pull secrets needed by `images`.
///
/// Images outside the configured private registry need none. For the
/// private registry the credential secret is refreshed (or created) first,
/// unless no credentials are configured, in which case nothing is written
/// but the reference is still returned, so a secret provisioned by other
/// means is picked up. The kubelet pulls anonymously when it is missing.
pub async fn pull_secrets_for<C>(
    cluster: &C,
    config: &Config,
    images: &[&str],
) -> Result<Vec<LocalObjectReference>>
where
    C: ClusterApi + ?Sized,
{
    let Some(registry) = config.registry.as_deref().filter(|r| !r.is_empty()) else {
        return Ok(Vec::new());
    };
    if !images.iter().any(|image| image_domain(image) == registry) {
        return Ok(Vec::new());
    }

    ensure_auth_secret(cluster, config).await?;

    Ok(vec![LocalObjectReference {
        name: Some(registry_secret_name(registry)),
    }])
}

async fn ensure_auth_secret<C>(cluster: &C, config: &Config) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    let Some((registry, username, password)) = config.registry_credentials() else {
        return Ok(());
    };
    let name = registry_secret_name(registry);
    let secret = create_registry_secret(&name, cluster.namespace(), registry, username, password)
        .map_err(|e| Error::Config(format!("unable to encode registry credentials: {e}")))?;

    match cluster.replace_secret(&secret).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            cluster.create_secret(&secret).await?;
            info!(secret = %name, "Created registry pull secret");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
