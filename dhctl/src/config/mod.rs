use std::{
    collections::{BTreeSet, HashSet},
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use dhctl_core::MASTER_NODE_GROUP_NAME;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    controller::DesiredNodeGroup,
    converge::ClusterTopology,
    lock::{LeaseLockConfig, LeaseLockConfigBuilder, LockUserInfo},
    ssh::SshSettings,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
    #[error("Deserialization error: {}", .0)]
    DeserializationError(serde_yaml::Error),
    #[error("Serialization error: {}", .0)]
    SerializationError(serde_json::Error),
    #[error("Invalid configuration: {}", .0)]
    Invalid(String),
}

/// Converge configuration file, one per cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConvergeConfig {
    pub cluster_prefix: String,
    pub masters: NodeGroupConfig,
    pub node_groups: Vec<NodeGroupConfig>,
    pub ssh: Option<SshSettings>,
    pub auto_approve: bool,
    pub auto_dismiss_destructive: bool,
    pub commander_mode: bool,
    pub api_server_hosts: Vec<String>,
    pub lock: LockConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeGroupConfig {
    pub name: String,
    pub replicas: usize,
    pub node_template: Option<Value>,
    /// Provider settings handed to the infra executor as-is.
    pub settings: Option<Value>,
    pub excluded_nodes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    pub identity: Option<String>,
    pub lease_duration_seconds: Option<u64>,
    pub renew_every_seconds: Option<u64>,
    pub retry_wait_seconds: Option<u64>,
    pub additional_user_info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
}

impl ConvergeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Used config path: {path:?}");

        let file = File::open(path).map_err(ConfigError::IoError)?;
        let config: ConvergeConfig =
            serde_yaml::from_reader(file).map_err(ConfigError::DeserializationError)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_prefix.is_empty() {
            return Err(ConfigError::Invalid("clusterPrefix is required".to_owned()));
        }

        if self.executor.command.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("executor.command is required".to_owned()));
        }

        if !self.masters.name.is_empty() && self.masters.name != MASTER_NODE_GROUP_NAME {
            return Err(ConfigError::Invalid(format!(
                "the master group must be named '{MASTER_NODE_GROUP_NAME}', got '{}'",
                self.masters.name
            )));
        }

        if self.masters.replicas == 0 {
            return Err(ConfigError::Invalid(
                "masters.replicas must be at least 1".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for group in &self.node_groups {
            if group.name.is_empty() {
                return Err(ConfigError::Invalid("every node group needs a name".to_owned()));
            }

            if group.name == MASTER_NODE_GROUP_NAME {
                return Err(ConfigError::Invalid(format!(
                    "'{MASTER_NODE_GROUP_NAME}' is reserved, configure it under masters"
                )));
            }

            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "node group '{}' is declared twice",
                    group.name
                )));
            }
        }

        Ok(())
    }

    pub fn topology(&self) -> Result<ClusterTopology, ConfigError> {
        let masters = NodeGroupConfig {
            name: MASTER_NODE_GROUP_NAME.to_owned(),
            ..self.masters.clone()
        };

        Ok(ClusterTopology {
            masters: masters.desired()?,
            node_groups: self
                .node_groups
                .iter()
                .map(NodeGroupConfig::desired)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Lease settings, `default_identity` is used when the file names none.
    pub fn lock_config(&self, default_identity: &str) -> Result<LeaseLockConfig, ConfigError> {
        let mut builder = LeaseLockConfigBuilder::default();

        builder
            .identity(
                self.lock
                    .identity
                    .clone()
                    .unwrap_or_else(|| default_identity.to_owned()),
            )
            .user_info(LockUserInfo::local(self.lock.additional_user_info.clone()));

        if let Some(seconds) = self.lock.lease_duration_seconds {
            builder.lease_duration(Duration::from_secs(seconds));
        }

        if let Some(seconds) = self.lock.renew_every_seconds {
            builder.renew_every(Duration::from_secs(seconds));
        }

        if let Some(seconds) = self.lock.retry_wait_seconds {
            builder.retry_wait(Duration::from_secs(seconds));
        }

        let config = builder
            .build()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        if config.renew_every >= config.lease_duration {
            return Err(ConfigError::Invalid(
                "lock.renewEverySeconds must be shorter than lock.leaseDurationSeconds".to_owned(),
            ));
        }

        Ok(config)
    }
}

impl NodeGroupConfig {
    fn desired(&self) -> Result<DesiredNodeGroup, ConfigError> {
        let settings = self
            .settings
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(ConfigError::SerializationError)?;

        Ok(DesiredNodeGroup {
            name: self.name.clone(),
            replicas: self.replicas,
            node_template: self.node_template.clone(),
            settings,
            excluded_nodes: self.excluded_nodes.clone(),
        })
    }
}
