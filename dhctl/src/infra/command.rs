use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use data_encoding::BASE64;
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use tokio_util::sync::CancellationToken;

use super::{
    ApplyOutput, InfraError, InfraExecutor, MasterBootstrapResult, NodeRequest, OutputMode,
    PlanSummary,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    cluster_prefix: &'a str,
    node_group: &'a str,
    node_name: &'a str,
    node_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_config: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_mode: Option<OutputMode>,
}

impl<'a> WireRequest<'a> {
    fn new(request: &'a NodeRequest, output_mode: Option<OutputMode>) -> Self {
        Self {
            cluster_prefix: &request.cluster_prefix,
            node_group: &request.node_group,
            node_name: &request.node_name,
            node_index: request.node_index,
            settings: request.settings.as_deref().map(|value| BASE64.encode(value)),
            cloud_config: request.cloud_config.as_deref(),
            state: request.state.as_deref().map(|value| BASE64.encode(value)),
            output_mode,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireApplyResponse {
    state: String,
    master_address: Option<String>,
    internal_ip: Option<String>,
    kube_data_device_path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAddressResponse {
    master_address: String,
}

/// Runs `<command> [args..] <action>` per node, JSON over stdin and stdout.
pub struct CommandExecutor {
    command: PathBuf,
    args: Vec<String>,
    cancellation: CancellationToken,
}

impl CommandExecutor {
    pub fn new(command: PathBuf, args: Vec<String>, cancellation: CancellationToken) -> Self {
        Self {
            command,
            args,
            cancellation,
        }
    }

    async fn call<R: DeserializeOwned>(
        &self,
        action: &str,
        request: &NodeRequest,
        output_mode: Option<OutputMode>,
    ) -> Result<R, InfraError> {
        let node = &request.node_name;
        let mut body = serde_json::to_vec(&WireRequest::new(request, output_mode)).map_err(
            |error| InfraError::Protocol {
                node: node.clone(),
                message: error.to_string(),
            },
        )?;
        body.push(b'\n');

        debug!("Running infra executor '{action}' for '{node}'");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(InfraError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await.map_err(InfraError::Spawn)?;
        }

        let output = tokio::select! {
            _ = self.cancellation.cancelled() => {
                return Err(InfraError::Interrupted(node.clone()));
            }
            output = child.wait_with_output() => output.map_err(InfraError::Spawn)?,
        };

        if !output.status.success() {
            return Err(InfraError::Failed {
                action: action.to_owned(),
                node: node.clone(),
                message: format!("executor exited with {}", output.status),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|error| InfraError::Protocol {
            node: node.clone(),
            message: error.to_string(),
        })
    }
}

fn decode_state(node: &str, state: &str) -> Result<Vec<u8>, InfraError> {
    BASE64
        .decode(state.as_bytes())
        .map_err(|error| InfraError::Protocol {
            node: node.to_owned(),
            message: format!("state is not valid base64: {error}"),
        })
}

impl WireApplyResponse {
    fn into_output(self, node: &str) -> Result<ApplyOutput, InfraError> {
        Ok(ApplyOutput {
            state: decode_state(node, &self.state)?,
            master_address: self.master_address,
            internal_ip: self.internal_ip,
            kube_data_device_path: self.kube_data_device_path,
        })
    }
}

#[async_trait]
impl InfraExecutor for CommandExecutor {
    async fn plan(&self, request: &NodeRequest) -> Result<PlanSummary, InfraError> {
        self.call("plan", request, None).await
    }

    async fn apply(
        &self,
        request: &NodeRequest,
        mode: OutputMode,
    ) -> Result<ApplyOutput, InfraError> {
        self.call::<WireApplyResponse>("apply", request, Some(mode))
            .await?
            .into_output(&request.node_name)
    }

    async fn bootstrap_node(&self, request: &NodeRequest) -> Result<ApplyOutput, InfraError> {
        self.call::<WireApplyResponse>("bootstrap-node", request, Some(OutputMode::OnlyState))
            .await?
            .into_output(&request.node_name)
    }

    async fn bootstrap_master(
        &self,
        request: &NodeRequest,
    ) -> Result<MasterBootstrapResult, InfraError> {
        let node = &request.node_name;
        let output = self
            .call::<WireApplyResponse>("bootstrap-master", request, Some(OutputMode::WithOutputs))
            .await?
            .into_output(node)?;
        let missing = |field: &str| InfraError::Protocol {
            node: node.clone(),
            message: format!("'{field}' output is missing"),
        };

        Ok(MasterBootstrapResult {
            external_ssh_address: output.master_address.ok_or_else(|| missing("masterAddress"))?,
            internal_ip: output.internal_ip.ok_or_else(|| missing("internalIp"))?,
            infrastructure_state: output.state,
            kube_data_device_path: output.kube_data_device_path,
        })
    }

    async fn destroy(&self, request: &NodeRequest) -> Result<(), InfraError> {
        self.call::<serde::de::IgnoredAny>("destroy", request, None)
            .await
            .map(|_| ())
    }

    async fn master_address(&self, request: &NodeRequest) -> Result<String, InfraError> {
        self.call::<WireAddressResponse>("master-address", request, Some(OutputMode::OnlyState))
            .await
            .map(|response| response.master_address)
    }
}
