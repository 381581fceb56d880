//! One full converge run: lock, masters, worker groups, cleanup.

use std::{collections::BTreeSet, sync::Arc};

use dhctl_core::{MASTER_NODE_GROUP_NAME, STATE_EXPORTER_DEPLOYMENT_NAME, SYSTEM_NAMESPACE};
use itertools::Itertools;
use log::{error, info, warn};

use crate::{
    context::ConvergeContext,
    controller::{
        cloud_permanent::converge_cloud_permanent_group, master::converge_masters,
        DesiredNodeGroup,
    },
    error::ConvergeError,
    lock::{LeaseLock, LeaseLockConfig},
    restart::restart_deployment,
    state::nodes::{load_node_group_names, load_node_group_state},
    switcher::{cleanup_node_user, switch_to_node_user},
    version::{check_version, VersionCheckOptions, VersionStatus},
};

/// Declared topology of the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    pub masters: DesiredNodeGroup,
    pub node_groups: Vec<DesiredNodeGroup>,
}

#[derive(Debug, Clone)]
pub struct ConvergeRequest {
    pub topology: ClusterTopology,
    pub lock: LeaseLockConfig,
    pub force_lock: bool,
    pub version_check: VersionCheckOptions,
}

pub async fn converge(ctx: &ConvergeContext, request: &ConvergeRequest) -> Result<(), ConvergeError> {
    match check_version(
        ctx.kube_client().as_ref(),
        &ctx.options().tool_version,
        request.version_check,
        ctx.cancellation(),
    )
    .await?
    {
        VersionStatus::Tolerated(message) => warn!("{message}"),
        VersionStatus::Matched(version) => info!("Cluster runs Deckhouse {version}"),
        VersionStatus::Skipped => {}
    }

    let cancellation = ctx.cancellation().clone();
    let lock = Arc::new(
        LeaseLock::new(
            request.lock.clone(),
            Arc::clone(ctx.kube_holder()),
            ctx.cancellation().clone(),
        )
        .on_renew_error(Arc::new(move |error| {
            error!("Converge lock is lost, stopping: {error}");
            cancellation.cancel();
        })),
    );

    lock.lock(request.force_lock).await?;
    lock.start_auto_renew();
    ctx.set_lock_runner(Some(Arc::clone(&lock)));

    let result = run_phases(ctx, &request.topology).await;

    ctx.set_lock_runner(None);
    if let Err(unlock_error) = lock.unlock().await {
        warn!("Couldn't release the converge lock: {unlock_error}");
        if result.is_ok() {
            return Err(unlock_error.into());
        }
    }

    result
}

async fn run_phases(ctx: &ConvergeContext, topology: &ClusterTopology) -> Result<(), ConvergeError> {
    ctx.load_converge_state().await?;

    let masters = load_node_group_state(ctx, MASTER_NODE_GROUP_NAME).await?;
    switch_to_node_user(ctx, &masters).await?;

    converge_masters(ctx, &topology.masters).await?;

    let configured: Vec<&DesiredNodeGroup> = topology
        .node_groups
        .iter()
        .filter(|group| group.name != MASTER_NODE_GROUP_NAME)
        .sorted_by(|left, right| left.name.cmp(&right.name))
        .collect();

    for group in &configured {
        ctx.check_interrupted()?;
        converge_cloud_permanent_group(ctx, group, true).await?;
    }

    let known: BTreeSet<&str> = configured.iter().map(|group| group.name.as_str()).collect();
    let obsolete: Vec<String> = load_node_group_names(ctx)
        .await?
        .into_iter()
        .filter(|name| name != MASTER_NODE_GROUP_NAME && !known.contains(name.as_str()))
        .collect();

    if !obsolete.is_empty() {
        info!("Node groups absent from the configuration: {}", obsolete.iter().join(", "));
    }

    for name in obsolete {
        ctx.check_interrupted()?;

        let desired = DesiredNodeGroup {
            name,
            replicas: 0,
            ..Default::default()
        };
        converge_cloud_permanent_group(ctx, &desired, false).await?;
    }

    restart_deployment(ctx, SYSTEM_NAMESPACE, STATE_EXPORTER_DEPLOYMENT_NAME).await?;
    cleanup_node_user(ctx).await?;

    info!("Converge finished");

    Ok(())
}
