use anyhow::Context;
use dhctl_core::kubernetes::operations::{create_local_client, KubeClusterApi};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{CheckVersionArgs, GlobalArgs},
    version::{check_version, VersionCheckOptions, VersionStatus, DHCTL_VERSION},
};

pub async fn check_cluster_version(
    global_args: &GlobalArgs,
    args: &CheckVersionArgs,
    cancellation: CancellationToken,
) -> anyhow::Result<()> {
    let client = create_local_client(&global_args.kube_config, &global_args.kube_context)
        .await
        .context("Couldn't initialize k8s API client!")?;

    let options = VersionCheckOptions {
        allow_missing_version: args.allow_missing_version,
        ..Default::default()
    };

    let status = check_version(
        &KubeClusterApi::new(client),
        DHCTL_VERSION,
        options,
        &cancellation,
    )
    .await
    .context("Version check failed!")?;

    match status {
        VersionStatus::Skipped => info!("Development build, nothing to compare"),
        VersionStatus::Matched(version) => info!("dhctl matches Deckhouse {version}"),
        VersionStatus::Tolerated(message) => warn!("{message}"),
    }

    Ok(())
}
