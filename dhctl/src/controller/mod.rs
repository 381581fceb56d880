//! Add / update / delete reconciliation of one node group.
//!
//! [`reconcile`] drives the phases shared by every group; the
//! [`NodeGroupBehavior`] implementations decide how nodes are added, updated
//! and deleted. Node-level work always follows descending index order.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_encoding::BASE64;
use dhctl_core::{
    kubernetes::{
        errors::{is_conflict, is_not_found},
        unstructured::set_nested_field,
    },
    naming::{missing_indices, node_index, sort_by_index_descending},
    resources::{
        nodegroup::{get_node_template, NODE_TEMPLATE_PATH},
        secret::{
            get_manual_bootstrap_secret_name, get_manual_bootstrap_secret_namespace,
            NodeStateRecord, API_SERVER_ENDPOINTS_KEY, CLOUD_CONFIG_KEY,
        },
    },
    MASTER_NODE_GROUP_NAME,
};
use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    context::ConvergeContext,
    error::ConvergeError,
    hooks::InfraActionHook,
    infra::pipeline::destroy_node,
    retry::RetryLoop,
    state::{
        nodes::{delete_node_state, load_node_group_state, NodeGroupState},
        with_deadline,
    },
};

pub mod cloud_permanent;
pub mod master;
pub mod nodes;

const NODE_TEMPLATE_ATTEMPTS: u32 = 10;
const NODE_TEMPLATE_RETRY_WAIT: Duration = Duration::from_secs(3);
const TRANSPORT_ATTEMPTS: u32 = 10;
const TRANSPORT_RETRY_WAIT: Duration = Duration::from_secs(5);

/// A node group as the operator declared it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredNodeGroup {
    pub name: String,
    pub replicas: usize,
    pub node_template: Option<Value>,
    pub settings: Option<Vec<u8>>,
    pub excluded_nodes: BTreeSet<String>,
}

/// Everything one reconciliation of a group works with.
#[derive(Debug, Clone)]
pub struct GroupRun {
    pub name: String,
    pub desired_replicas: usize,
    pub state: NodeGroupState,
    pub settings: Option<Vec<u8>>,
    pub excluded_nodes: BTreeSet<String>,
    pub node_template: Option<Value>,
    /// base64-encoded bootstrap payload, refreshed as membership changes
    pub cloud_config: Option<String>,
    /// Groups absent from the configuration lose their NodeGroup object.
    pub in_configuration: bool,
}

impl GroupRun {
    pub fn new(desired: &DesiredNodeGroup, state: NodeGroupState, in_configuration: bool) -> Self {
        let settings = desired.settings.clone().or_else(|| state.settings.clone());

        Self {
            name: desired.name.clone(),
            desired_replicas: desired.replicas,
            state,
            settings,
            excluded_nodes: desired.excluded_nodes.clone(),
            node_template: desired.node_template.clone(),
            cloud_config: None,
            in_configuration,
        }
    }

    pub async fn load(
        ctx: &ConvergeContext,
        desired: &DesiredNodeGroup,
        in_configuration: bool,
    ) -> Result<Self, ConvergeError> {
        let state = load_node_group_state(ctx, &desired.name).await?;

        Ok(Self::new(desired, state, in_configuration))
    }

    pub fn record(&self, node_name: &str, state: Vec<u8>) -> NodeStateRecord {
        NodeStateRecord {
            node_group: self.name.clone(),
            node_name: node_name.to_owned(),
            state,
            settings: self.settings.clone(),
            kube_data_device_path: None,
        }
    }

    pub fn node_names_descending(&self) -> Vec<String> {
        let mut names = self.state.node_names();
        sort_by_index_descending(&mut names);

        names
    }

    /// Highest-indexed nodes beyond the desired replica count.
    pub fn deletion_candidates(&self) -> Vec<String> {
        let names = self.node_names_descending();
        let surplus = names.len().saturating_sub(self.desired_replicas);

        names.into_iter().take(surplus).collect()
    }

    pub fn existing_indices(&self) -> Result<BTreeSet<u32>, ConvergeError> {
        self.state
            .nodes
            .keys()
            .map(|name| node_index(name).map_err(ConvergeError::from))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Unchanged,
    Updated,
    /// Applying the update needs a temporary multi-master topology.
    ScaleThroughMultiMaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    ScaleThroughMultiMaster,
}

/// Group-specific parts of the reconciliation.
#[async_trait]
pub trait NodeGroupBehavior: Send {
    async fn prepare(&mut self, _ctx: &ConvergeContext, _run: &GroupRun) -> Result<(), ConvergeError> {
        Ok(())
    }

    async fn add_nodes(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        indices: Vec<u32>,
    ) -> Result<(), ConvergeError>;

    async fn update_node(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        node_name: &str,
    ) -> Result<UpdateOutcome, ConvergeError>;

    async fn delete_nodes(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        node_names: &[String],
    ) -> Result<(), ConvergeError>;

    /// Ssh address of a node, when the group is reached over ssh.
    fn ssh_host(&self, _node_name: &str) -> Option<String> {
        None
    }
}

pub async fn reconcile<B: NodeGroupBehavior>(
    ctx: &ConvergeContext,
    behavior: &mut B,
    run: &mut GroupRun,
) -> Result<ReconcileOutcome, ConvergeError> {
    let group = run.name.clone();
    info!(
        "Converging node group '{group}': {} node(s) in state, {} desired",
        run.state.nodes.len(),
        run.desired_replicas
    );

    behavior.prepare(ctx, run).await?;

    if run.desired_replicas > 0 {
        run.cloud_config = Some(fetch_cloud_config(ctx, &group, &[]).await?);
    }

    let current = run.state.nodes.len();
    if run.desired_replicas > current {
        let indices = missing_indices(&run.existing_indices()?, run.desired_replicas - current);
        info!("Adding {} node(s) to '{group}'", indices.len());
        behavior.add_nodes(ctx, run, indices).await?;
    }

    let candidates = run.deletion_candidates();
    let to_delete: Vec<String> = candidates
        .iter()
        .filter(|name| {
            let excluded = run.excluded_nodes.contains(*name);
            if excluded {
                warn!("Node '{name}' is excluded from converge and won't be deleted");
            }
            !excluded
        })
        .cloned()
        .collect();

    if !to_delete.is_empty() && ctx.switches_node_user() && ctx.destructive_changes_allowed() {
        let hosts: Vec<String> = to_delete
            .iter()
            .filter_map(|name| behavior.ssh_host(name))
            .collect();
        repair_transport(ctx, &hosts).await?;
    }

    let mut failures = Vec::new();
    for name in run.node_names_descending() {
        if candidates.contains(&name) {
            continue;
        }

        if run.excluded_nodes.contains(&name) {
            warn!("Node '{name}' is excluded from converge, skipping its update");
            continue;
        }

        ctx.check_interrupted()?;

        match behavior.update_node(ctx, run, &name).await {
            Ok(UpdateOutcome::ScaleThroughMultiMaster) => {
                return Ok(ReconcileOutcome::ScaleThroughMultiMaster)
            }
            Ok(UpdateOutcome::Updated) if run.desired_replicas > 0 => {
                run.cloud_config = Some(fetch_cloud_config(ctx, &group, &[]).await?);
            }
            Ok(_) => {}
            Err(error) if ctx.aborts_on_first_error() || error.is_interrupted() => {
                return Err(error)
            }
            Err(error) => {
                warn!("Couldn't converge node '{name}': {error}");
                failures.push((name, error));
            }
        }
    }

    if !to_delete.is_empty() {
        match ctx.destructive_changes_allowed() {
            true => {
                info!("Deleting node(s) of '{group}': {}", to_delete.join(", "));
                if let Err(error) = behavior.delete_nodes(ctx, run, &to_delete).await {
                    match error {
                        ConvergeError::NodeFailures(nodes) => failures.extend(nodes),
                        error if error.is_interrupted() => return Err(error),
                        error => failures.push((group.clone(), error)),
                    }
                }
            }
            false => info!(
                "Skipping deletion of {} because destructive changes are dismissed",
                to_delete.join(", ")
            ),
        }
    }

    if let Some(template) = &run.node_template {
        reconcile_node_template(ctx, &group, template).await?;
    }

    if group != MASTER_NODE_GROUP_NAME
        && !run.in_configuration
        && ctx.destructive_changes_allowed()
    {
        delete_node_group(ctx, &group).await?;
    }

    ConvergeError::from_node_failures(failures)?;

    Ok(ReconcileOutcome::Done)
}

/// Bootstrap payload of a group, base64-encoded.
///
/// Every host in `api_server_hosts` and in `extra_hosts` must already be
/// listed among the secret's API server endpoints.
pub async fn fetch_cloud_config(
    ctx: &ConvergeContext,
    group: &str,
    extra_hosts: &[String],
) -> Result<String, ConvergeError> {
    let namespace = get_manual_bootstrap_secret_namespace();
    let name = get_manual_bootstrap_secret_name(group);
    let expected: Vec<&String> = ctx
        .options()
        .api_server_hosts
        .iter()
        .chain(extra_hosts)
        .collect();
    let options = ctx.options();

    RetryLoop::new(
        format!("Get cloud config for node group '{group}'"),
        options.cloud_config_attempts,
        options.cloud_config_wait,
    )
    .break_if(ConvergeError::is_interrupted)
    .with_cancellation(ctx.cancellation())
    .run(|| async {
        let not_ready = |reason: String| ConvergeError::CloudConfigNotReady {
            group: group.to_owned(),
            reason,
        };

        let secret = match with_deadline(
            &format!("get secret '{name}'"),
            ctx.kube_client().get_secret(namespace, &name),
        )
        .await?
        {
            Ok(secret) => secret,
            Err(error) if is_not_found(&error) => {
                return Err(not_ready(format!("secret '{namespace}/{name}' doesn't exist")))
            }
            Err(error) => return Err(ConvergeError::kube(format!("get secret '{name}'"), error)),
        };

        let data = secret.data.unwrap_or_default();
        let cloud_config = data
            .get(CLOUD_CONFIG_KEY)
            .ok_or_else(|| not_ready(format!("'{CLOUD_CONFIG_KEY}' is missing")))?;

        if !expected.is_empty() {
            let endpoints: Vec<String> = data
                .get(API_SERVER_ENDPOINTS_KEY)
                .map(|raw| serde_yaml::from_slice(&raw.0))
                .transpose()
                .map_err(|error| not_ready(format!("malformed {API_SERVER_ENDPOINTS_KEY}: {error}")))?
                .unwrap_or_default();

            let missing: Vec<&str> = expected
                .iter()
                .filter(|host| !endpoints.iter().any(|endpoint| endpoint_matches(endpoint, host)))
                .map(|host| host.as_str())
                .collect();

            if !missing.is_empty() {
                return Err(not_ready(format!(
                    "API server endpoints don't include {}",
                    missing.join(", ")
                )));
            }
        }

        Ok(BASE64.encode(&cloud_config.0))
    })
    .await
}

fn endpoint_matches(endpoint: &str, host: &str) -> bool {
    endpoint == host
        || endpoint
            .strip_prefix(host)
            .is_some_and(|rest| rest.starts_with(':'))
}

/// Pulls the ssh session off hosts that are about to be deleted.
async fn repair_transport(ctx: &ConvergeContext, hosts: &[String]) -> Result<(), ConvergeError> {
    let Some(current) = ctx.ssh() else {
        return Ok(());
    };
    let Some(current_host) = current.current_host() else {
        return Ok(());
    };

    if !hosts.contains(&current_host) {
        return Ok(());
    }

    info!("Ssh session is pinned to '{current_host}', which is about to be deleted; reconnecting");

    let settings = current.settings().without_hosts(hosts);
    let session = ctx.ssh_factory().create(settings);

    RetryLoop::new("Restart ssh session", TRANSPORT_ATTEMPTS, TRANSPORT_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async { session.start().await.map_err(ConvergeError::from) })
        .await?;

    let client = ctx.kube_connector().connect(Arc::clone(&session)).await?;
    ctx.set_kube_client(client);
    ctx.set_ssh(session);
    current.stop().await;

    Ok(())
}

/// Destroys one node and removes every trace of it.
pub async fn delete_node(
    ctx: &ConvergeContext,
    run: &mut GroupRun,
    node_name: &str,
    hook: &dyn InfraActionHook,
) -> Result<(), ConvergeError> {
    let request = ctx.node_request(
        &run.name,
        node_name,
        run.state.nodes.get(node_name).cloned(),
        run.settings.clone(),
        None,
    )?;

    destroy_node(ctx, &request, hook).await?;
    nodes::delete_node_object(ctx, node_name).await?;
    delete_node_state(ctx, node_name).await?;
    run.state.nodes.remove(node_name);
    hook.after_cleanup(node_name).await?;

    info!("Node '{node_name}' deleted");

    ctx.check_interrupted()
}

/// Deletes `node_names` one by one, collecting failures.
pub async fn delete_nodes_in_order(
    ctx: &ConvergeContext,
    run: &mut GroupRun,
    node_names: &[String],
    hook: &dyn InfraActionHook,
) -> Result<(), ConvergeError> {
    let mut failures = Vec::new();

    for name in node_names {
        ctx.check_interrupted()?;

        if let Err(error) = delete_node(ctx, run, name, hook).await {
            if ctx.aborts_on_first_error() || error.is_interrupted() {
                return Err(error);
            }

            warn!("Couldn't delete node '{name}': {error}");
            failures.push((name.clone(), error));
        }
    }

    ConvergeError::from_node_failures(failures)
}

fn is_conflict_error(error: &ConvergeError) -> bool {
    matches!(error, ConvergeError::KubeApi { source, .. } if is_conflict(source))
}

async fn reconcile_node_template(
    ctx: &ConvergeContext,
    group: &str,
    desired: &Value,
) -> Result<(), ConvergeError> {
    let action = format!("update node template of '{group}'");
    let mut attempt = 0;

    RetryLoop::new(&action, NODE_TEMPLATE_ATTEMPTS, NODE_TEMPLATE_RETRY_WAIT)
        .break_if(|error| !is_conflict_error(error))
        .with_cancellation(ctx.cancellation())
        .run(|| {
            attempt += 1;
            let first_attempt = attempt == 1;
            let action = &action;

            async move {
                let client = ctx.kube_client();
                let mut node_group = match with_deadline(action, client.get_node_group(group)).await? {
                    Ok(node_group) => node_group,
                    Err(error) if is_not_found(&error) => {
                        warn!("NodeGroup '{group}' doesn't exist, skipping its node template");
                        return Ok(());
                    }
                    Err(error) => return Err(ConvergeError::kube(action, error)),
                };

                if get_node_template(&node_group) == *desired {
                    debug!("Node template of '{group}' is up to date");
                    return Ok(());
                }

                if first_attempt
                    && !ctx.confirm(&format!(
                        "Node template of '{group}' differs from the configuration. Update it?"
                    ))
                {
                    info!("Node template update of '{group}' was skipped");
                    return Ok(());
                }

                set_nested_field(&mut node_group.data, &NODE_TEMPLATE_PATH, desired.clone())
                    .map_err(ConvergeError::State)?;

                with_deadline(action, client.replace_node_group(&node_group))
                    .await?
                    .map_err(|error| ConvergeError::kube(action, error))?;
                info!("Node template of '{group}' updated");

                Ok(())
            }
        })
        .await
}

async fn delete_node_group(ctx: &ConvergeContext, group: &str) -> Result<(), ConvergeError> {
    let action = format!("delete NodeGroup '{group}'");

    RetryLoop::new(&action, NODE_TEMPLATE_ATTEMPTS, NODE_TEMPLATE_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            match with_deadline(&action, ctx.kube_client().delete_node_group(group)).await? {
                Err(error) if is_not_found(&error) => Ok(()),
                result => result.map_err(|error| ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    info!("NodeGroup '{group}' deleted");

    Ok(())
}
