use std::{collections::BTreeMap, time::Duration};

use dhctl_core::{
    kubernetes::errors::is_not_found, resources::labels::get_node_group_selector,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use log::{debug, info, warn};

use crate::{
    context::ConvergeContext,
    error::ConvergeError,
    hooks::NodeReadinessChecker,
    retry::RetryLoop,
    state::with_deadline,
};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const DRAIN_GRACE_PERIOD_SECONDS: u32 = 60;
const NODE_API_ATTEMPTS: u32 = 10;
const NODE_API_RETRY_WAIT: Duration = Duration::from_secs(5);
const TOO_MANY_REQUESTS: u16 = 429;

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// Pods left alone by a drain: mirror pods and DaemonSet members.
fn skips_eviction(pod: &Pod) -> bool {
    let metadata = &pod.metadata;

    if metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(MIRROR_POD_ANNOTATION))
    {
        return true;
    }

    metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"))
}

/// Cordons the node and evicts its workload. A node that is already gone
/// counts as drained.
pub async fn drain_node(ctx: &ConvergeContext, node_name: &str) -> Result<(), ConvergeError> {
    let action = format!("cordon node '{node_name}'");

    let cordoned = RetryLoop::new(&action, NODE_API_ATTEMPTS, NODE_API_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            match with_deadline(&action, ctx.kube_client().cordon_node(node_name)).await? {
                Ok(()) => Ok(true),
                Err(error) if is_not_found(&error) => Ok(false),
                Err(error) => Err(ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    if !cordoned {
        info!("Node '{node_name}' is already gone, nothing to drain");
        return Ok(());
    }

    let action = format!("list pods of node '{node_name}'");
    let fields = format!("spec.nodeName={node_name}");
    let pods = RetryLoop::silent(&action, NODE_API_ATTEMPTS, NODE_API_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            with_deadline(&action, ctx.kube_client().list_pods(None, None, Some(&fields)))
                .await?
                .map_err(|error| ConvergeError::kube(&action, error))
        })
        .await?;

    for pod in pods.iter().filter(|pod| !skips_eviction(pod)) {
        let (Some(namespace), Some(name)) = (&pod.metadata.namespace, &pod.metadata.name) else {
            continue;
        };

        evict_pod(ctx, namespace, name).await?;
    }

    info!("Node '{node_name}' drained");

    Ok(())
}

async fn evict_pod(ctx: &ConvergeContext, namespace: &str, name: &str) -> Result<(), ConvergeError> {
    let action = format!("evict pod '{namespace}/{name}'");

    RetryLoop::new(&action, NODE_API_ATTEMPTS, NODE_API_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            match with_deadline(
                &action,
                ctx.kube_client()
                    .evict_pod(namespace, name, DRAIN_GRACE_PERIOD_SECONDS),
            )
            .await?
            {
                Ok(()) => Ok(()),
                Err(error) if is_not_found(&error) => Ok(()),
                Err(kube::Error::Api(response)) if response.code == TOO_MANY_REQUESTS => {
                    Err(ConvergeError::State(format!(
                        "eviction of '{namespace}/{name}' is blocked by a disruption budget"
                    )))
                }
                Err(error) => Err(ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    debug!("Pod '{namespace}/{name}' evicted");

    Ok(())
}

/// Runs after the node's infrastructure is destroyed, so it ignores interrupts.
pub async fn delete_node_object(ctx: &ConvergeContext, node_name: &str) -> Result<(), ConvergeError> {
    let action = format!("delete node '{node_name}'");

    RetryLoop::new(&action, NODE_API_ATTEMPTS, NODE_API_RETRY_WAIT)
        .run(|| async {
            match with_deadline(&action, ctx.kube_client().delete_node(node_name)).await? {
                Err(error) if is_not_found(&error) => Ok(()),
                result => result.map_err(|error| ConvergeError::kube(&action, error)),
            }
        })
        .await
}

/// Readiness of `names` in one shot: `NodeReady` plus the optional checker.
pub async fn not_ready_nodes(
    ctx: &ConvergeContext,
    group: &str,
    names: &[String],
    checker: Option<&dyn NodeReadinessChecker>,
) -> Result<Vec<String>, ConvergeError> {
    let action = format!("list nodes of group '{group}'");
    let selector = get_node_group_selector(group);
    let nodes = with_deadline(&action, ctx.kube_client().list_nodes(Some(&selector)))
        .await?
        .map_err(|error| ConvergeError::kube(&action, error))?;

    let ready: BTreeMap<String, bool> = nodes
        .iter()
        .filter_map(|node| Some((node.metadata.name.clone()?, is_node_ready(node))))
        .collect();

    let mut pending = Vec::new();
    for name in names {
        if !ready.get(name).copied().unwrap_or(false) {
            pending.push(name.clone());
            continue;
        }

        if let Some(checker) = checker {
            if !checker.is_ready(name).await? {
                debug!("Node '{name}' is Ready but {} is not", checker.name());
                pending.push(name.clone());
            }
        }
    }

    Ok(pending)
}

pub async fn wait_nodes_ready(
    ctx: &ConvergeContext,
    group: &str,
    names: &[String],
    checker: Option<&dyn NodeReadinessChecker>,
) -> Result<(), ConvergeError> {
    if names.is_empty() {
        return Ok(());
    }

    let options = ctx.options();

    RetryLoop::new(
        format!("Waiting for nodes of group '{group}' to become Ready"),
        options.readiness_attempts,
        options.readiness_wait,
    )
    .break_if(ConvergeError::is_interrupted)
    .with_cancellation(ctx.cancellation())
    .run(|| async {
        match not_ready_nodes(ctx, group, names, checker).await? {
            pending if pending.is_empty() => Ok(()),
            pending => Err(ConvergeError::NodesNotReady(pending)),
        }
    })
    .await
    .map_err(|error| {
        if let ConvergeError::NodesNotReady(pending) = &error {
            warn!("Nodes didn't become ready in time: {}", pending.join(", "));
        }
        error
    })?;

    info!("Nodes of group '{group}' are ready: {}", names.join(", "));

    Ok(())
}
