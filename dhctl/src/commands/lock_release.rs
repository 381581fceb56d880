use std::sync::Arc;

use anyhow::Context;
use dhctl_core::kubernetes::{
    operations::{create_local_client, KubeClusterApi},
    KubeClientHolder,
};
use log::warn;
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{GlobalArgs, LockReleaseArgs},
    lock::{LeaseLock, LeaseLockConfigBuilder, LockUserInfo},
};

pub async fn release_lock(
    global_args: &GlobalArgs,
    args: &LockReleaseArgs,
    cancellation: CancellationToken,
) -> anyhow::Result<()> {
    let client = create_local_client(&global_args.kube_config, &global_args.kube_context)
        .await
        .context("Couldn't initialize k8s API client!")?;

    let user = LockUserInfo::local(None);
    let config = LeaseLockConfigBuilder::default()
        .name(args.name.clone())
        .namespace(args.namespace.clone())
        .identity(format!("{}@{}", user.name, user.host))
        .user_info(user)
        .build()?;

    warn!(
        "Releasing lease '{}' in '{}' regardless of its holder...",
        args.name, args.namespace
    );

    let holder = Arc::new(KubeClientHolder::new(Arc::new(KubeClusterApi::new(client))));
    LeaseLock::new(config, holder, cancellation)
        .unlock()
        .await
        .context("Couldn't release the converge lock!")?;

    Ok(())
}
