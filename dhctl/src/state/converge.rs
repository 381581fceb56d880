use std::{sync::Arc, time::Duration};

use dhctl_core::{
    kubernetes::{
        errors::{is_already_exists, is_not_found},
        KubeClientHolder,
    },
    resources::secret::generate_converge_state_secret,
    CONVERGE_STATE_SECRET_KEY, CONVERGE_STATE_SECRET_NAME, SYSTEM_NAMESPACE,
};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{error::ConvergeError, nodeuser::NodeUserCredentials, retry::RetryLoop};

use super::with_deadline;

const STATE_ATTEMPTS: u32 = 10;
const STATE_RETRY_WAIT: Duration = Duration::from_secs(3);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    Empty,
    ScaleToMultiMaster,
    ScaleToSingleMaster,
}

impl Phase {
    pub fn is_empty(&self) -> bool {
        matches!(self, Phase::Empty)
    }

    /// Phases only move forward: empty, multi-master, single-master, empty.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Empty, Phase::ScaleToMultiMaster)
                | (Phase::ScaleToMultiMaster, Phase::ScaleToSingleMaster)
                | (Phase::ScaleToSingleMaster, Phase::Empty)
        ) || *self == next
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConvergeState {
    #[serde(default, skip_serializing_if = "Phase::is_empty")]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_user_credentials: Option<NodeUserCredentials>,
}

/// `d8-system/d8-dhctl-converge-state`, written only by the lease holder.
pub struct ConvergeStateStore {
    kube: Arc<KubeClientHolder>,
    cancellation: CancellationToken,
}

impl ConvergeStateStore {
    pub fn new(kube: Arc<KubeClientHolder>, cancellation: CancellationToken) -> Self {
        Self { kube, cancellation }
    }

    pub async fn get(&self) -> Result<ConvergeState, ConvergeError> {
        let secret = RetryLoop::silent("Get converge state", STATE_ATTEMPTS, STATE_RETRY_WAIT)
            .break_if(ConvergeError::is_interrupted)
            .with_cancellation(&self.cancellation)
            .run(|| async {
                let client = self.kube.client();
                match with_deadline(
                    "get converge state",
                    client.get_secret(SYSTEM_NAMESPACE, CONVERGE_STATE_SECRET_NAME),
                )
                .await?
                {
                    Ok(secret) => Ok(Some(secret)),
                    Err(error) if is_not_found(&error) => Ok(None),
                    Err(error) => Err(ConvergeError::kube("get converge state", error)),
                }
            })
            .await?;

        let Some(secret) = secret else {
            debug!("Converge state secret is absent, starting from scratch");
            return Ok(ConvergeState::default());
        };

        let Some(raw) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(CONVERGE_STATE_SECRET_KEY))
        else {
            return Ok(ConvergeState::default());
        };

        serde_json::from_slice(&raw.0).map_err(|error| ConvergeError::State(error.to_string()))
    }

    pub async fn set(&self, state: &ConvergeState) -> Result<(), ConvergeError> {
        let body =
            serde_json::to_vec(state).map_err(|error| ConvergeError::State(error.to_string()))?;
        let secret = generate_converge_state_secret(body);

        RetryLoop::new("Save converge state", STATE_ATTEMPTS, STATE_RETRY_WAIT)
            .break_if(ConvergeError::is_interrupted)
            .with_cancellation(&self.cancellation)
            .run(|| async {
                let client = self.kube.client();
                match with_deadline("create converge state", client.create_secret(&secret)).await? {
                    Ok(_) => Ok(()),
                    Err(error) if is_already_exists(&error) => {
                        with_deadline("update converge state", client.replace_secret(&secret))
                            .await?
                            .map(|_| ())
                            .map_err(|error| ConvergeError::kube("update converge state", error))
                    }
                    Err(error) => Err(ConvergeError::kube("create converge state", error)),
                }
            })
            .await
    }

    pub async fn delete(&self) -> Result<(), ConvergeError> {
        RetryLoop::new("Delete converge state", STATE_ATTEMPTS, STATE_RETRY_WAIT)
            .break_if(ConvergeError::is_interrupted)
            .with_cancellation(&self.cancellation)
            .run(|| async {
                let client = self.kube.client();
                match with_deadline(
                    "delete converge state",
                    client.delete_secret(SYSTEM_NAMESPACE, CONVERGE_STATE_SECRET_NAME),
                )
                .await?
                {
                    Err(error) if is_not_found(&error) => Ok(()),
                    result => {
                        result.map_err(|error| ConvergeError::kube("delete converge state", error))
                    }
                }
            })
            .await
    }
}
