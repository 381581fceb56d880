use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use dhctl_core::{
    kubernetes::errors::{is_already_exists, is_not_found},
    naming::validate_unique_indices,
    resources::{
        labels::{get_all_node_states_selector, get_node_group_states_selector},
        secret::{get_node_state_secret_name, NodeStateRecord},
    },
    SYSTEM_NAMESPACE,
};
use log::{debug, warn};

use crate::{context::ConvergeContext, error::ConvergeError, retry::RetryLoop};

use super::{
    cache::{node_state_key, StateCache},
    with_deadline,
};

const NODE_STATE_ATTEMPTS: u32 = 10;
const NODE_STATE_RETRY_WAIT: Duration = Duration::from_secs(5);

/// In-memory copy of one group's infra state, owned by its controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeGroupState {
    pub name: String,
    pub nodes: BTreeMap<String, Vec<u8>>,
    pub settings: Option<Vec<u8>>,
}

impl NodeGroupState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    fn from_records(name: &str, records: Vec<NodeStateRecord>) -> Result<Self, ConvergeError> {
        let mut state = Self::new(name);

        for record in records {
            if state.settings.is_none() {
                state.settings = record.settings.clone();
            }

            state.nodes.insert(record.node_name, record.state);
        }

        validate_unique_indices(state.nodes.keys().map(String::as_str))?;

        Ok(state)
    }
}

pub async fn load_node_group_state(
    ctx: &ConvergeContext,
    group: &str,
) -> Result<NodeGroupState, ConvergeError> {
    let records = list_records(ctx, &get_node_group_states_selector(group)).await?;

    NodeGroupState::from_records(group, records)
}

/// Every group that has per-node state in the cluster.
pub async fn load_node_group_names(ctx: &ConvergeContext) -> Result<BTreeSet<String>, ConvergeError> {
    let records = list_records(ctx, &get_all_node_states_selector()).await?;

    Ok(records.into_iter().map(|record| record.node_group).collect())
}

async fn list_records(
    ctx: &ConvergeContext,
    selector: &str,
) -> Result<Vec<NodeStateRecord>, ConvergeError> {
    let secrets = RetryLoop::new("List node states", NODE_STATE_ATTEMPTS, NODE_STATE_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            with_deadline(
                "list node states",
                ctx.kube_client().list_secrets(SYSTEM_NAMESPACE, selector),
            )
            .await?
            .map_err(|error| ConvergeError::kube("list node states", error))
        })
        .await?;

    let mut records = Vec::with_capacity(secrets.len());
    for secret in &secrets {
        match NodeStateRecord::from_secret(secret) {
            Ok(record) => records.push(record),
            Err(error) => warn!("Skipping malformed node state secret: {error}"),
        }
    }

    Ok(records)
}

/// Persists the node state in the cluster and mirrors it into the local cache.
///
/// Follows an infra action that already happened, so an interrupt doesn't
/// stop it; the caller checks for one afterwards.
pub async fn save_node_state(
    ctx: &ConvergeContext,
    record: &NodeStateRecord,
) -> Result<(), ConvergeError> {
    let secret = record.generate_secret();
    let action = format!("save state of node '{}'", record.node_name);

    RetryLoop::new(&action, NODE_STATE_ATTEMPTS, NODE_STATE_RETRY_WAIT)
        .run(|| async {
            let client = ctx.kube_client();
            match with_deadline(&action, client.create_secret(&secret)).await? {
                Ok(_) => Ok(()),
                Err(error) if is_already_exists(&error) => {
                    with_deadline(&action, client.replace_secret(&secret))
                        .await?
                        .map(|_| ())
                        .map_err(|error| ConvergeError::kube(&action, error))
                }
                Err(error) => Err(ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    debug!("State of node '{}' saved", record.node_name);
    ctx.cache()
        .save(&node_state_key(&record.node_name), &record.state)?;

    Ok(())
}

/// Like [`save_node_state`], runs to completion even after an interrupt.
pub async fn delete_node_state(ctx: &ConvergeContext, node_name: &str) -> Result<(), ConvergeError> {
    let secret_name = get_node_state_secret_name(node_name);
    let action = format!("delete state of node '{node_name}'");

    RetryLoop::new(&action, NODE_STATE_ATTEMPTS, NODE_STATE_RETRY_WAIT)
        .run(|| async {
            match with_deadline(
                &action,
                ctx.kube_client().delete_secret(SYSTEM_NAMESPACE, &secret_name),
            )
            .await?
            {
                Err(error) if is_not_found(&error) => Ok(()),
                result => result.map_err(|error| ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    delete_cached_node_state(ctx.cache(), node_name)
}

pub fn delete_cached_node_state(
    cache: &dyn StateCache,
    node_name: &str,
) -> Result<(), ConvergeError> {
    cache.delete(&node_state_key(node_name))?;

    Ok(())
}
