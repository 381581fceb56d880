//! Moves the ssh session, and the kube transport built on top of it, from
//! the operator identity to the generated converge user.
//!
//! Masters may re-key their transport while being converged, so the run
//! switches to a short-lived local user it owns before touching them.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dhctl_core::{
    kubernetes::{errors::is_not_found, KubeApi},
    resources::{annotations::get_node_user_annotation, labels::get_master_nodes_selector},
    INSTALL_DATA_CONFIGMAP_NAME, MASTER_NODE_GROUP_NAME, SYSTEM_NAMESPACE,
};
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;

use crate::{
    context::ConvergeContext,
    error::ConvergeError,
    nodeuser::{create_or_update_node_user, delete_node_user, NodeUserCredentials, NodeUserError},
    retry::RetryLoop,
    ssh::{SshClient, SshSettings},
    state::{nodes::NodeGroupState, with_deadline},
};

/// Clusters installed before this release only accept one key per session.
const MODERN_SSH_SINCE: (u64, u64) = (1, 60);
const INSTALL_DATA_VERSION_KEY: &str = "version";

const NODE_USER_WAIT_ATTEMPTS: u32 = 60;
const NODE_USER_WAIT: Duration = Duration::from_secs(5);
const SESSION_START_ATTEMPTS: u32 = 10;
const SESSION_START_WAIT: Duration = Duration::from_secs(5);

pub async fn switch_to_node_user(
    ctx: &ConvergeContext,
    masters: &NodeGroupState,
) -> Result<(), ConvergeError> {
    if !ctx.switches_node_user() {
        debug!("Node user switch is disabled in commander mode");
        return Ok(());
    }

    ctx.check_interrupted()?;

    let credentials = ensure_credentials(ctx).await?;
    wait_for_node_user(ctx, &credentials.name).await?;

    let Some(current) = ctx.ssh() else {
        info!("No ssh session to switch, keeping the current kube client");
        return Ok(());
    };

    let key_path = write_private_key(ctx, &credentials).await?;

    for (node_name, state) in &masters.nodes {
        let request = ctx.node_request(
            MASTER_NODE_GROUP_NAME,
            node_name,
            Some(state.clone()),
            masters.settings.clone(),
            None,
        )?;
        let address = ctx.executor().master_address(&request).await?;
        debug!("Master '{node_name}' is reachable at {address}");
        current.add_host(&address);
    }

    let lock = ctx.lock_runner().filter(|lock| lock.is_auto_renewing());
    if let Some(lock) = &lock {
        lock.stop_auto_renew();
    }

    let switched = install_session(ctx, &current, &credentials, &key_path).await;

    if let Some(lock) = lock {
        let relocked = match &switched {
            Ok(()) => lock.lock(false).await,
            Err(_) => Ok(()),
        };
        lock.start_auto_renew();
        relocked?;
    }

    switched?;
    info!("Switched to node user '{}'", credentials.name);

    Ok(())
}

/// Brings up the node user session and its kube client next to the current
/// ones. The current session is stopped only after both work; on failure
/// it stays installed.
async fn install_session(
    ctx: &ConvergeContext,
    current: &Arc<dyn SshClient>,
    credentials: &NodeUserCredentials,
    key_path: &Path,
) -> Result<(), ConvergeError> {
    let legacy = is_legacy_cluster(ctx).await?;
    let session = ctx
        .ssh_factory()
        .create(session_settings(&current.settings(), credentials, key_path, legacy));

    let client = match connect_session(ctx, &session, key_path, legacy).await {
        Ok(client) => client,
        Err(error) => {
            warn!("Keeping the current ssh session, the node user one failed: {error}");
            session.stop().await;
            return Err(error);
        }
    };

    ctx.set_kube_client(client);
    ctx.set_ssh(session);
    current.stop().await;

    Ok(())
}

async fn connect_session(
    ctx: &ConvergeContext,
    session: &Arc<dyn SshClient>,
    key_path: &Path,
    legacy: bool,
) -> Result<Arc<dyn KubeApi>, ConvergeError> {
    start_session(ctx, session.as_ref()).await?;
    if legacy {
        session.add_key_to_agent(key_path).await?;
    }

    Ok(ctx.kube_connector().connect(Arc::clone(session)).await?)
}

/// Drops the converge state and the generated user. Both are idempotent.
pub async fn cleanup_node_user(ctx: &ConvergeContext) -> Result<(), ConvergeError> {
    if !ctx.switches_node_user() {
        return Ok(());
    }

    let credentials = ctx.converge_state().node_user_credentials;

    ctx.delete_converge_state().await?;

    if let Some(credentials) = credentials {
        delete_node_user(ctx, &credentials.name).await?;

        let key_path = private_key_path(ctx, &credentials);
        if let Err(error) = tokio::fs::remove_file(&key_path).await {
            debug!("Couldn't remove {}: {error}", key_path.display());
        }

        info!("Node user '{}' removed", credentials.name);
    }

    Ok(())
}

async fn ensure_credentials(ctx: &ConvergeContext) -> Result<NodeUserCredentials, ConvergeError> {
    if let Some(credentials) = ctx.converge_state().node_user_credentials {
        debug!("Reusing node user '{}' from the converge state", credentials.name);
        return Ok(credentials);
    }

    let issuer = ctx.issuer();
    let generated = tokio::task::spawn_blocking(move || issuer.issue())
        .await
        .map_err(|error| NodeUserError::Task(error.to_string()))??;

    create_or_update_node_user(ctx, &generated.node_user).await?;
    ctx.set_node_user_credentials(generated.credentials.clone())
        .await?;

    Ok(generated.credentials)
}

async fn wait_for_node_user(ctx: &ConvergeContext, user_name: &str) -> Result<(), ConvergeError> {
    let annotation = get_node_user_annotation(user_name);
    let selector = get_master_nodes_selector();

    RetryLoop::new(
        format!("Waiting for node user '{user_name}' on masters"),
        NODE_USER_WAIT_ATTEMPTS,
        NODE_USER_WAIT,
    )
    .break_if(ConvergeError::is_interrupted)
    .with_cancellation(ctx.cancellation())
    .run(|| async {
        let nodes = with_deadline("list masters", ctx.kube_client().list_nodes(Some(&selector)))
            .await?
            .map_err(|error| ConvergeError::kube("list masters", error))?;

        let pending: Vec<String> = nodes
            .iter()
            .filter(|node| {
                !node
                    .metadata
                    .annotations
                    .as_ref()
                    .is_some_and(|annotations| annotations.contains_key(&annotation))
            })
            .filter_map(|node| node.metadata.name.clone())
            .collect();

        match pending.is_empty() {
            true => Ok(()),
            false => Err(ConvergeError::NodesNotReady(pending)),
        }
    })
    .await
}

fn private_key_path(ctx: &ConvergeContext, credentials: &NodeUserCredentials) -> PathBuf {
    ctx.options()
        .scratch_dir
        .join(format!("{}.key", credentials.name))
}

async fn write_private_key(
    ctx: &ConvergeContext,
    credentials: &NodeUserCredentials,
) -> Result<PathBuf, ConvergeError> {
    let key = credentials.decrypted_private_key()?;
    let path = private_key_path(ctx, credentials);
    let scratch_dir = &ctx.options().scratch_dir;

    tokio::fs::create_dir_all(scratch_dir)
        .await
        .map_err(|error| ConvergeError::ScratchFile(scratch_dir.clone(), error))?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let scratch_error = |error| ConvergeError::ScratchFile(path.clone(), error);
    let mut file = options.open(&path).await.map_err(scratch_error)?;
    file.write_all(key.as_bytes()).await.map_err(scratch_error)?;
    // tokio writes in the background until flushed
    file.flush().await.map_err(scratch_error)?;
    file.sync_all().await.map_err(scratch_error)?;

    debug!("Node user key written to {}", path.display());

    Ok(path)
}

fn session_settings(
    current: &SshSettings,
    credentials: &NodeUserCredentials,
    key_path: &Path,
    legacy: bool,
) -> SshSettings {
    let private_keys = match legacy {
        true => vec![key_path.to_owned()],
        false => current
            .private_keys
            .iter()
            .cloned()
            .chain([key_path.to_owned()])
            .collect(),
    };

    SshSettings {
        user: credentials.name.clone(),
        private_keys,
        ..current.clone()
    }
}

async fn start_session(ctx: &ConvergeContext, session: &dyn SshClient) -> Result<(), ConvergeError> {
    RetryLoop::new(
        "Start ssh session as the node user",
        SESSION_START_ATTEMPTS,
        SESSION_START_WAIT,
    )
    .break_if(ConvergeError::is_interrupted)
    .with_cancellation(ctx.cancellation())
    .run(|| async { session.start().await.map_err(ConvergeError::from) })
    .await
}

/// Clusters without install data, or installed before 1.60, use one key
/// loaded into the ssh agent.
async fn is_legacy_cluster(ctx: &ConvergeContext) -> Result<bool, ConvergeError> {
    let action = format!("get configmap '{INSTALL_DATA_CONFIGMAP_NAME}'");
    let install_data = match with_deadline(
        &action,
        ctx.kube_client()
            .get_config_map(SYSTEM_NAMESPACE, INSTALL_DATA_CONFIGMAP_NAME),
    )
    .await?
    {
        Ok(config_map) => config_map,
        Err(error) if is_not_found(&error) => {
            debug!("No install data, assuming a legacy cluster");
            return Ok(true);
        }
        Err(error) => return Err(ConvergeError::kube(&action, error)),
    };

    let version = install_data
        .data
        .as_ref()
        .and_then(|data| data.get(INSTALL_DATA_VERSION_KEY))
        .cloned()
        .unwrap_or_default();

    Ok(is_legacy_version(&version))
}

fn is_legacy_version(version: &str) -> bool {
    let version = dhctl_core::helpers::canonicalize_version(version);
    let mut parts = version.split('.').map(|part| part.parse::<u64>());

    match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => (major, minor) < MODERN_SSH_SINCE,
        _ => {
            warn!("Can't parse install version '{version}', assuming a modern cluster");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use dhctl_core::{CONVERGE_STATE_SECRET_NAME, SYSTEM_NAMESPACE};

    use crate::{
        lock::{LeaseLock, LeaseLockConfigBuilder},
        ssh::SshError,
        state::nodes::NodeGroupState,
        testing::{ready_node, test_node_user, TestEnvironment},
    };

    use super::*;

    fn masters() -> NodeGroupState {
        let mut state = NodeGroupState::new(MASTER_NODE_GROUP_NAME);
        state
            .nodes
            .insert("cluster-master-0".to_owned(), b"m0".to_vec());
        state
    }

    #[test]
    fn install_version_gates_the_legacy_mode() {
        assert!(is_legacy_version("v1.59.9"));
        assert!(is_legacy_version("1.8.0"));
        assert!(!is_legacy_version("1.60.0"));
        assert!(!is_legacy_version(" v2.0.1"));
        assert!(!is_legacy_version("dev"));
    }

    #[test]
    fn modern_sessions_keep_the_operator_keys() {
        let current = SshSettings {
            user: "ubuntu".into(),
            hosts: vec!["203.0.113.10".into()],
            bastion_host: Some("bastion".into()),
            private_keys: vec!["/home/op/.ssh/id_rsa".into()],
            ..Default::default()
        };
        let credentials = test_node_user().credentials;
        let key = Path::new("/tmp/dhctl/user.key");

        let modern = session_settings(&current, &credentials, key, false);
        assert_eq!(modern.user, credentials.name);
        assert_eq!(modern.private_keys.len(), 2);
        assert_eq!(modern.bastion_host.as_deref(), Some("bastion"));
        assert_eq!(modern.hosts, current.hosts);

        let legacy = session_settings(&current, &credentials, key, true);
        assert_eq!(legacy.private_keys, vec![key.to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_installs_a_new_session_and_client() {
        let env = TestEnvironment::new();
        env.cluster.put_node(ready_node("cluster-master-0", "master"));
        env.cluster.put_install_version("v1.62.0");
        let ctx = env.context();
        ctx.load_converge_state().await.unwrap();
        let initial_client = ctx.kube_client();

        switch_to_node_user(&ctx, &masters()).await.unwrap();

        let credentials = ctx.converge_state().node_user_credentials.unwrap();
        let session = ctx.ssh().unwrap();
        assert_eq!(session.settings().user, credentials.name);
        assert_eq!(session.settings().private_keys.len(), 2);
        assert!(session
            .settings()
            .hosts
            .contains(&"203.0.113.10".to_owned()));
        assert!(session.current_host().is_some());
        assert!(env.ssh.agent_keys().is_empty());
        assert!(!Arc::ptr_eq(&initial_client, &ctx.kube_client()));
        assert_eq!(env.connector.connections(), 1);
        assert!(env.cluster.node_user(&credentials.name).is_some());

        let key = std::fs::read_to_string(private_key_path(&ctx, &credentials)).unwrap();
        assert!(key.contains("OPENSSH PRIVATE KEY"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(private_key_path(&ctx, &credentials))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_switch_keeps_the_operator_session_and_the_lease() {
        let env = TestEnvironment::new();
        env.cluster.put_node(ready_node("cluster-master-0", "master"));
        env.cluster.put_install_version("v1.62.0");
        env.connector.refuse_connections();
        let ctx = env.context();
        ctx.load_converge_state().await.unwrap();

        let operator_session = ctx.ssh().unwrap();
        operator_session.start().await.unwrap();
        let initial_client = ctx.kube_client();
        let lock = Arc::new(LeaseLock::new(
            LeaseLockConfigBuilder::default()
                .identity("operator")
                .build()
                .unwrap(),
            Arc::clone(ctx.kube_holder()),
            env.cancellation.clone(),
        ));
        lock.lock(false).await.unwrap();
        lock.start_auto_renew();
        ctx.set_lock_runner(Some(Arc::clone(&lock)));

        let error = switch_to_node_user(&ctx, &masters()).await.unwrap_err();

        assert!(matches!(error, ConvergeError::Ssh(SshError::KubeConnect(_))));
        assert!(Arc::ptr_eq(&operator_session, &ctx.ssh().unwrap()));
        assert!(operator_session.current_host().is_some());
        assert!(Arc::ptr_eq(&initial_client, &ctx.kube_client()));
        assert!(lock.is_auto_renewing());

        lock.stop_auto_renew();
    }

    #[tokio::test]
    async fn private_key_is_complete_on_every_write() {
        let env = TestEnvironment::new();
        let ctx = env.context();
        let credentials = test_node_user().credentials;
        let expected = credentials.decrypted_private_key().unwrap();

        std::fs::create_dir_all(&ctx.options().scratch_dir).unwrap();
        std::fs::write(
            private_key_path(&ctx, &credentials),
            "x".repeat(expected.len() * 2),
        )
        .unwrap();

        for _ in 0..3 {
            let path = write_private_key(&ctx, &credentials).await.unwrap();

            assert_eq!(std::fs::read_to_string(&path).unwrap(), expected.as_str());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_clusters_load_the_key_into_the_agent() {
        let env = TestEnvironment::new();
        env.cluster.put_node(ready_node("cluster-master-0", "master"));
        let ctx = env.context();
        ctx.load_converge_state().await.unwrap();

        switch_to_node_user(&ctx, &masters()).await.unwrap();

        assert_eq!(ctx.ssh().unwrap().settings().private_keys.len(), 1);
        assert_eq!(env.ssh.agent_keys().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commander_mode_never_switches() {
        let env = TestEnvironment::new().with_options(|options| options.commander_mode = true);
        let ctx = env.context();

        switch_to_node_user(&ctx, &masters()).await.unwrap();
        cleanup_node_user(&ctx).await.unwrap();

        assert_eq!(env.cluster.call_count("create_node_user"), 0);
        assert_eq!(env.connector.connections(), 0);
        assert_eq!(env.cluster.call_count("delete_secret"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_then_switch_issues_fresh_credentials() {
        let env = TestEnvironment::new();
        env.cluster.put_node(ready_node("cluster-master-0", "master"));
        let ctx = env.context();
        ctx.load_converge_state().await.unwrap();

        switch_to_node_user(&ctx, &masters()).await.unwrap();
        let first = ctx.converge_state().node_user_credentials.unwrap();

        cleanup_node_user(&ctx).await.unwrap();
        cleanup_node_user(&ctx).await.unwrap();

        assert!(env.cluster.node_user(&first.name).is_none());
        assert!(env
            .cluster
            .secret(SYSTEM_NAMESPACE, CONVERGE_STATE_SECRET_NAME)
            .is_none());
        assert!(ctx.converge_state().node_user_credentials.is_none());

        switch_to_node_user(&ctx, &masters()).await.unwrap();
        let second = ctx.converge_state().node_user_credentials.unwrap();

        assert_ne!(first.name, second.name);
    }
}
