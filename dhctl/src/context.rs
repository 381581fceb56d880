use std::{path::PathBuf, sync::Arc, time::Duration};

use derive_builder::Builder;
use dhctl_core::{
    kubernetes::{KubeApi, KubeClientHolder},
    naming::node_index,
};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ConvergeError,
    infra::{InfraExecutor, NodeRequest},
    lock::LeaseLock,
    nodeuser::{NodeUserCredentials, NodeUserIssuer},
    prompt::Confirm,
    ssh::{KubeConnector, SshClient, SshClientFactory},
    state::{
        cache::StateCache,
        converge::{ConvergeState, ConvergeStateStore, Phase},
    },
};

#[derive(Debug, Clone, Builder)]
pub struct ConvergeOptions {
    #[builder(setter(into))]
    pub cluster_prefix: String,
    #[builder(default = "crate::version::DHCTL_VERSION.to_owned()", setter(into))]
    pub tool_version: String,
    #[builder(default)]
    pub auto_approve: bool,
    #[builder(default)]
    pub auto_dismiss_destructive: bool,
    #[builder(default)]
    pub commander_mode: bool,
    #[builder(default)]
    pub api_server_hosts: Vec<String>,
    #[builder(default = "std::env::temp_dir().join(\"dhctl\")")]
    pub scratch_dir: PathBuf,
    #[builder(default = "100")]
    pub readiness_attempts: u32,
    #[builder(default = "Duration::from_secs(20)")]
    pub readiness_wait: Duration,
    #[builder(default = "45")]
    pub cloud_config_attempts: u32,
    #[builder(default = "Duration::from_secs(5)")]
    pub cloud_config_wait: Duration,
}

/// Long-lived collaborators handed to the Core by its caller.
pub struct Collaborators {
    pub kube: Arc<KubeClientHolder>,
    pub ssh: Option<Arc<dyn SshClient>>,
    pub ssh_factory: Arc<dyn SshClientFactory>,
    pub kube_connector: Arc<dyn KubeConnector>,
    pub executor: Arc<dyn InfraExecutor>,
    pub cache: Arc<dyn StateCache>,
    pub issuer: Arc<dyn NodeUserIssuer>,
    pub confirm: Confirm,
}

/// Everything a converge run shares between its phases.
///
/// The kube client sits behind [`KubeClientHolder`] so the switcher can
/// replace it while other holders (the lease lock) keep working.
pub struct ConvergeContext {
    kube: Arc<KubeClientHolder>,
    ssh: RwLock<Option<Arc<dyn SshClient>>>,
    ssh_factory: Arc<dyn SshClientFactory>,
    kube_connector: Arc<dyn KubeConnector>,
    executor: Arc<dyn InfraExecutor>,
    cache: Arc<dyn StateCache>,
    issuer: Arc<dyn NodeUserIssuer>,
    confirm: Confirm,
    options: ConvergeOptions,
    cancellation: CancellationToken,
    lock_runner: Mutex<Option<Arc<LeaseLock>>>,
    state_store: ConvergeStateStore,
    state: Mutex<ConvergeState>,
}

impl ConvergeContext {
    pub fn new(
        collaborators: Collaborators,
        options: ConvergeOptions,
        cancellation: CancellationToken,
    ) -> Self {
        let state_store =
            ConvergeStateStore::new(Arc::clone(&collaborators.kube), cancellation.clone());

        Self {
            kube: collaborators.kube,
            ssh: RwLock::new(collaborators.ssh),
            ssh_factory: collaborators.ssh_factory,
            kube_connector: collaborators.kube_connector,
            executor: collaborators.executor,
            cache: collaborators.cache,
            issuer: collaborators.issuer,
            confirm: collaborators.confirm,
            options,
            cancellation,
            lock_runner: Mutex::new(None),
            state_store,
            state: Mutex::new(ConvergeState::default()),
        }
    }

    pub fn options(&self) -> &ConvergeOptions {
        &self.options
    }

    pub fn kube_holder(&self) -> &Arc<KubeClientHolder> {
        &self.kube
    }

    pub fn kube_client(&self) -> Arc<dyn KubeApi> {
        self.kube.client()
    }

    pub fn set_kube_client(&self, client: Arc<dyn KubeApi>) {
        self.kube.set_client(client);
    }

    pub fn ssh(&self) -> Option<Arc<dyn SshClient>> {
        self.ssh.read().clone()
    }

    pub fn set_ssh(&self, ssh: Arc<dyn SshClient>) {
        *self.ssh.write() = Some(ssh);
    }

    pub fn ssh_factory(&self) -> &dyn SshClientFactory {
        self.ssh_factory.as_ref()
    }

    pub fn kube_connector(&self) -> &dyn KubeConnector {
        self.kube_connector.as_ref()
    }

    pub fn executor(&self) -> &dyn InfraExecutor {
        self.executor.as_ref()
    }

    pub fn cache(&self) -> &dyn StateCache {
        self.cache.as_ref()
    }

    pub fn issuer(&self) -> Arc<dyn NodeUserIssuer> {
        Arc::clone(&self.issuer)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn check_interrupted(&self) -> Result<(), ConvergeError> {
        match self.is_interrupted() {
            true => Err(ConvergeError::Interrupted),
            false => Ok(()),
        }
    }

    pub fn commander_mode(&self) -> bool {
        self.options.commander_mode
    }

    /// NodeUser provisioning and the ssh switch only happen standalone.
    pub fn switches_node_user(&self) -> bool {
        !self.options.commander_mode
    }

    pub fn writes_host_cache(&self) -> bool {
        !self.options.commander_mode
    }

    pub fn aborts_on_first_error(&self) -> bool {
        self.options.commander_mode
    }

    pub fn destructive_changes_allowed(&self) -> bool {
        !self.options.auto_dismiss_destructive
    }

    pub fn confirm(&self, message: &str) -> bool {
        if self.options.commander_mode || self.options.auto_approve {
            debug!("Auto-approved: {message}");
            return true;
        }

        (self.confirm)(message)
    }

    pub fn lock_runner(&self) -> Option<Arc<LeaseLock>> {
        self.lock_runner.lock().clone()
    }

    pub fn set_lock_runner(&self, lock: Option<Arc<LeaseLock>>) {
        *self.lock_runner.lock() = lock;
    }

    pub fn converge_state(&self) -> ConvergeState {
        self.state.lock().clone()
    }

    pub async fn load_converge_state(&self) -> Result<ConvergeState, ConvergeError> {
        let state = self.state_store.get().await?;
        *self.state.lock() = state.clone();

        Ok(state)
    }

    pub async fn set_phase(&self, phase: Phase) -> Result<(), ConvergeError> {
        let mut state = self.converge_state();

        if !state.phase.can_transition_to(phase) {
            return Err(ConvergeError::State(format!(
                "phase can't change from {:?} to {phase:?}",
                state.phase
            )));
        }

        state.phase = phase;
        self.state_store.set(&state).await?;
        *self.state.lock() = state;
        info!("Converge phase is now {phase:?}");

        Ok(())
    }

    pub async fn set_node_user_credentials(
        &self,
        credentials: NodeUserCredentials,
    ) -> Result<(), ConvergeError> {
        let mut state = self.converge_state();
        state.node_user_credentials = Some(credentials);
        self.state_store.set(&state).await?;
        *self.state.lock() = state;

        Ok(())
    }

    pub async fn delete_converge_state(&self) -> Result<(), ConvergeError> {
        self.state_store.delete().await?;
        *self.state.lock() = ConvergeState::default();

        Ok(())
    }

    pub fn node_request(
        &self,
        group: &str,
        node_name: &str,
        state: Option<Vec<u8>>,
        settings: Option<Vec<u8>>,
        cloud_config: Option<String>,
    ) -> Result<NodeRequest, ConvergeError> {
        Ok(NodeRequest {
            cluster_prefix: self.options.cluster_prefix.clone(),
            node_group: group.to_owned(),
            node_name: node_name.to_owned(),
            node_index: node_index(node_name)?,
            settings,
            cloud_config,
            state,
        })
    }
}
