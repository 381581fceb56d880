use std::time::Duration;

use dhctl_core::{
    helpers::{canonicalize_version, image_tag},
    kubernetes::{errors::is_not_found, KubeApi},
    DECKHOUSE_DEPLOYMENT_NAME, PROVIDER_CLUSTER_CONFIGURATION_SECRET_NAME, SYSTEM_NAMESPACE,
};
use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{error::ConvergeError, retry::RetryLoop, state::with_deadline};

pub const DHCTL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Development builds skip the check.
const UNCHECKED_VERSIONS: [&str; 2] = ["local", "dev"];
const PROVIDER_CONFIGURATION_KEY: &str = "cloud-provider-cluster-configuration.yaml";

const VERSION_ATTEMPTS: u32 = 5;
const VERSION_RETRY_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum VersionError {
    #[error(
        "Version mismatch: dhctl {tool} can't work with a cluster running Deckhouse {cluster}. \
        Please use dhctl of version {cluster}."
    )]
    Mismatch { tool: String, cluster: String },
    #[error("Couldn't determine the installed Deckhouse version: {}", .0)]
    Missing(String),
    #[error("Deckhouse image '{}' isn't tagged, can't tell its version!", .0)]
    UntaggedImage(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCheckOptions {
    /// Any failure becomes a warning, used when tearing a cluster down.
    pub allow_any_error: bool,
    pub allow_missing_version: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStatus {
    Skipped,
    Matched(String),
    /// The check failed but the options let the run continue.
    Tolerated(String),
}

/// Installed Deckhouse version, canonicalized.
///
/// A deployed `DeckhouseRelease` wins over the deckhouse deployment image tag.
pub async fn installed_version(
    client: &dyn KubeApi,
    cancellation: &CancellationToken,
) -> Result<String, ConvergeError> {
    let releases = RetryLoop::silent("List Deckhouse releases", VERSION_ATTEMPTS, VERSION_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(cancellation)
        .run(|| async {
            match with_deadline("list releases", client.list_deckhouse_releases()).await? {
                Err(error) if is_not_found(&error) => Ok(Vec::new()),
                result => result.map_err(|error| ConvergeError::kube("list releases", error)),
            }
        })
        .await?;

    let deployed = releases
        .iter()
        .filter(|release| release.is_deployed())
        .map(|release| canonicalize_version(&release.spec.version))
        .find(|version| !version.is_empty());

    if let Some(version) = deployed {
        debug!("Deckhouse version from the deployed release: {version}");
        return Ok(version);
    }

    let action = format!("get deployment '{DECKHOUSE_DEPLOYMENT_NAME}'");
    let deployment = RetryLoop::silent(&action, VERSION_ATTEMPTS, VERSION_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(cancellation)
        .run(|| async {
            match with_deadline(
                &action,
                client.get_deployment(SYSTEM_NAMESPACE, DECKHOUSE_DEPLOYMENT_NAME),
            )
            .await?
            {
                Ok(deployment) => Ok(Some(deployment)),
                Err(error) if is_not_found(&error) => Ok(None),
                Err(error) => Err(ConvergeError::kube(&action, error)),
            }
        })
        .await?
        .ok_or_else(|| {
            VersionError::Missing(format!(
                "no deployed release and no '{SYSTEM_NAMESPACE}/{DECKHOUSE_DEPLOYMENT_NAME}' \
                deployment"
            ))
        })?;

    let image = deployment
        .spec
        .and_then(|spec| spec.template.spec)
        .and_then(|spec| spec.containers.into_iter().next())
        .and_then(|container| container.image)
        .ok_or_else(|| VersionError::Missing("deckhouse deployment has no image".to_owned()))?;

    let version = image_tag(&image)
        .map(canonicalize_version)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| VersionError::UntaggedImage(image.clone()))?;
    debug!("Deckhouse version from the '{image}' image: {version}");

    Ok(version)
}

pub async fn check_version(
    client: &dyn KubeApi,
    tool_version: &str,
    options: VersionCheckOptions,
    cancellation: &CancellationToken,
) -> Result<VersionStatus, ConvergeError> {
    let tool_version = canonicalize_version(tool_version);

    if UNCHECKED_VERSIONS.contains(&tool_version.as_str()) {
        info!("dhctl version '{tool_version}' skips the version check");
        return Ok(VersionStatus::Skipped);
    }

    log_provider_kind(client).await;

    let cluster_version = match installed_version(client, cancellation).await {
        Ok(version) => version,
        Err(error @ ConvergeError::Version(VersionError::Missing(_)))
            if options.allow_missing_version || options.allow_any_error =>
        {
            warn!("{error}");
            return Ok(VersionStatus::Tolerated(error.to_string()));
        }
        Err(error) if options.allow_any_error && !error.is_interrupted() => {
            warn!("Version check failed: {error}");
            return Ok(VersionStatus::Tolerated(error.to_string()));
        }
        Err(error) => return Err(error),
    };

    if cluster_version == tool_version {
        debug!("dhctl and the cluster both run version {tool_version}");
        return Ok(VersionStatus::Matched(cluster_version));
    }

    let error = VersionError::Mismatch {
        tool: tool_version,
        cluster: cluster_version,
    };

    if options.allow_any_error {
        warn!("{error}");
        return Ok(VersionStatus::Tolerated(error.to_string()));
    }

    Err(error.into())
}

/// Logs the provider kind of the cluster, purely as context.
async fn log_provider_kind(client: &dyn KubeApi) {
    let secret = match with_deadline(
        "get provider cluster configuration",
        client.get_secret(SYSTEM_NAMESPACE, PROVIDER_CLUSTER_CONFIGURATION_SECRET_NAME),
    )
    .await
    {
        Ok(Ok(secret)) => secret,
        _ => {
            debug!("No provider cluster configuration found");
            return;
        }
    };

    let kind = secret
        .data
        .as_ref()
        .and_then(|data| data.get(PROVIDER_CONFIGURATION_KEY))
        .and_then(|raw| serde_yaml::from_slice::<serde_yaml::Value>(&raw.0).ok())
        .and_then(|config| config.get("kind").and_then(|kind| kind.as_str().map(str::to_owned)));

    match kind {
        Some(kind) => debug!("Provider cluster configuration kind: {kind}"),
        None => debug!("Provider cluster configuration has no kind"),
    }
}
