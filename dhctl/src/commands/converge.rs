use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context};
use dhctl_core::kubernetes::{
    operations::{create_local_client, KubeClusterApi},
    KubeClientHolder,
};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{ConvergeArgs, GlobalArgs},
    config::ConvergeConfig,
    context::{Collaborators, ConvergeContext, ConvergeOptionsBuilder},
    converge::{converge, ConvergeRequest},
    infra::command::CommandExecutor,
    lock::LockUserInfo,
    nodeuser::RsaNodeUserIssuer,
    prompt::{always_approve, stdin_confirm},
    ssh::{
        kubeconfig::KubeconfigConnector,
        system::{SystemSshClient, SystemSshClientFactory},
        SshClient,
    },
    state::cache::{load_master_hosts, DirectoryCache, MemoryCache, StateCache},
    version::VersionCheckOptions,
};

const DEFAULT_CACHE_DIR: &str = ".cache/dhctl";

pub async fn converge_cluster(
    global_args: &GlobalArgs,
    args: &ConvergeArgs,
    cancellation: CancellationToken,
) -> anyhow::Result<()> {
    let config = ConvergeConfig::load(&args.config).with_context(|| {
        format!(
            "Couldn't load the converge configuration from '{}'!",
            args.config.display()
        )
    })?;

    info!("Converging cluster '{}'...", config.cluster_prefix);

    let auto_approve = args.auto_approve || config.auto_approve;
    let commander_mode = args.commander_mode || config.commander_mode;

    let options = ConvergeOptionsBuilder::default()
        .cluster_prefix(config.cluster_prefix.clone())
        .auto_approve(auto_approve)
        .auto_dismiss_destructive(args.auto_dismiss_destructive || config.auto_dismiss_destructive)
        .commander_mode(commander_mode)
        .api_server_hosts(config.api_server_hosts.clone())
        .build()?;

    let client = create_local_client(&global_args.kube_config, &global_args.kube_context)
        .await
        .context("Couldn't initialize k8s API client!")?;

    let cache: Arc<dyn StateCache> = match commander_mode {
        true => Arc::new(MemoryCache::new()),
        false => {
            let path = cache_dir(args, &config.cluster_prefix)?;
            debug!("Local state cache: {path:?}");
            Arc::new(
                DirectoryCache::open(&path)
                    .with_context(|| format!("Couldn't open the state cache at {path:?}!"))?,
            )
        }
    };

    let ssh = match &config.ssh {
        Some(settings) => {
            let session: Arc<dyn SshClient> =
                Arc::new(SystemSshClient::new(settings.clone(), cancellation.clone()));

            if settings.hosts.is_empty() {
                for host in load_master_hosts(cache.as_ref())?.values() {
                    session.add_host(host);
                }
            }

            session
                .start()
                .await
                .context("Couldn't start the ssh session!")?;

            Some(session)
        }
        None => None,
    };

    let collaborators = Collaborators {
        kube: Arc::new(KubeClientHolder::new(Arc::new(KubeClusterApi::new(client)))),
        ssh,
        ssh_factory: Arc::new(SystemSshClientFactory::new(cancellation.clone())),
        kube_connector: Arc::new(KubeconfigConnector::new(
            global_args.kube_config.clone(),
            global_args.kube_context.clone(),
            cancellation.clone(),
        )),
        executor: Arc::new(CommandExecutor::new(
            config.executor.command.clone(),
            config.executor.args.clone(),
            cancellation.clone(),
        )),
        cache,
        issuer: Arc::new(RsaNodeUserIssuer),
        confirm: match auto_approve {
            true => always_approve(),
            false => stdin_confirm(),
        },
    };

    let request = ConvergeRequest {
        topology: config.topology()?,
        lock: config.lock_config(&default_identity())?,
        force_lock: args.force_lock,
        version_check: VersionCheckOptions {
            allow_any_error: args.allow_version_mismatch,
            allow_missing_version: args.allow_missing_version,
        },
    };

    let ctx = ConvergeContext::new(collaborators, options, cancellation);
    let result = converge(&ctx, &request).await;

    ctx.kube_connector().stop().await;
    if let Some(ssh) = ctx.ssh() {
        ssh.stop().await;
    }

    result.context("Converge failed!")?;

    info!("Cluster '{}' converged!", config.cluster_prefix);

    Ok(())
}

fn cache_dir(args: &ConvergeArgs, cluster_prefix: &str) -> anyhow::Result<PathBuf> {
    if let Some(path) = &args.cache_dir {
        return Ok(path.join(cluster_prefix));
    }

    let home = home::home_dir().ok_or(anyhow!(
        "Couldn't determine the home directory, use --cache-dir!"
    ))?;

    Ok(home.join(DEFAULT_CACHE_DIR).join(cluster_prefix))
}

fn default_identity() -> String {
    let user = LockUserInfo::local(None);

    format!("{}@{}-{}", user.name, user.host, std::process::id())
}
