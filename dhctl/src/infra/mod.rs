use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod command;
pub mod pipeline;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("Infra executor couldn't {action} '{node}': {message}")]
    Failed {
        action: String,
        node: String,
        message: String,
    },
    #[error("Infra executor was interrupted while handling '{}'!", .0)]
    Interrupted(String),
    #[error("Couldn't run the infra executor: {}", .0)]
    Spawn(std::io::Error),
    #[error("Infra executor returned a malformed response for '{node}': {message}")]
    Protocol { node: String, message: String },
}

/// Which outputs the executor should produce besides the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputMode {
    OnlyState,
    WithOutputs,
}

/// Everything the executor needs to know about one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRequest {
    pub cluster_prefix: String,
    pub node_group: String,
    pub node_name: String,
    pub node_index: u32,
    pub settings: Option<Vec<u8>>,
    /// base64-encoded bootstrap payload of the group
    pub cloud_config: Option<String>,
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanSummary {
    pub has_changes: bool,
    pub has_destructive_changes: bool,
    pub destroyed_resources: Vec<String>,
}

impl PlanSummary {
    pub fn destroy() -> Self {
        Self {
            has_changes: true,
            has_destructive_changes: true,
            destroyed_resources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutput {
    pub state: Vec<u8>,
    pub master_address: Option<String>,
    pub internal_ip: Option<String>,
    pub kube_data_device_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterBootstrapResult {
    pub infrastructure_state: Vec<u8>,
    pub external_ssh_address: String,
    pub internal_ip: String,
    pub kube_data_device_path: Option<String>,
}

/// The external provisioner, one call per node.
#[async_trait]
pub trait InfraExecutor: Send + Sync {
    async fn plan(&self, request: &NodeRequest) -> Result<PlanSummary, InfraError>;
    async fn apply(
        &self,
        request: &NodeRequest,
        mode: OutputMode,
    ) -> Result<ApplyOutput, InfraError>;
    async fn bootstrap_node(&self, request: &NodeRequest) -> Result<ApplyOutput, InfraError>;
    async fn bootstrap_master(
        &self,
        request: &NodeRequest,
    ) -> Result<MasterBootstrapResult, InfraError>;
    async fn destroy(&self, request: &NodeRequest) -> Result<(), InfraError>;
    /// Externally reachable address of a master, computed without writing state.
    async fn master_address(&self, request: &NodeRequest) -> Result<String, InfraError>;
}
