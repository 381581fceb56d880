use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dhctl_core::kubernetes::KubeApi;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryInterrupted;

pub mod kubeconfig;
pub mod system;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("None of the hosts ({}) is reachable over ssh!", .0.join(", "))]
    NoReachableHost(Vec<String>),
    #[error("Host '{host}' is not reachable over ssh: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("Couldn't run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Couldn't add key '{}' to the ssh agent: {}", .0.display(), .1)]
    Agent(PathBuf, String),
    #[error("Couldn't connect to the Kubernetes API: {}", .0)]
    KubeConnect(String),
    #[error("Ssh session was interrupted!")]
    Interrupted,
}

impl From<RetryInterrupted> for SshError {
    fn from(_: RetryInterrupted) -> Self {
        SshError::Interrupted
    }
}

/// Ssh session settings, rebuilt by the switcher with the generated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub hosts: Vec<String>,
    pub bastion_host: Option<String>,
    pub bastion_port: Option<u16>,
    pub bastion_user: Option<String>,
    pub private_keys: Vec<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_owned(),
            port: DEFAULT_SSH_PORT,
            hosts: Vec::new(),
            bastion_host: None,
            bastion_port: None,
            bastion_user: None,
            private_keys: Vec::new(),
        }
    }
}

impl SshSettings {
    pub fn without_hosts(&self, removed: &[String]) -> Self {
        Self {
            hosts: self
                .hosts
                .iter()
                .filter(|host| !removed.contains(host))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait SshClient: Send + Sync {
    fn settings(&self) -> SshSettings;
    /// Host the session is currently pinned to, once started.
    fn current_host(&self) -> Option<String>;
    fn add_host(&self, host: &str);

    async fn start(&self) -> Result<(), SshError>;
    async fn stop(&self);
    async fn check_host(&self, host: &str) -> Result<(), SshError>;
    async fn add_key_to_agent(&self, key_path: &std::path::Path) -> Result<(), SshError>;
}

pub trait SshClientFactory: Send + Sync {
    fn create(&self, settings: SshSettings) -> Arc<dyn SshClient>;
}

/// Builds a cluster client that reaches the API through the ssh session.
///
/// A new connection replaces the previous one only once it works, so a
/// failed `connect` leaves the current client usable.
#[async_trait]
pub trait KubeConnector: Send + Sync {
    async fn connect(&self, ssh: Arc<dyn SshClient>) -> Result<Arc<dyn KubeApi>, SshError>;
    async fn stop(&self);
}
