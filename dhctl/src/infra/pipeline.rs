use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    context::ConvergeContext,
    error::ConvergeError,
    hooks::{HookDecision, InfraActionHook},
    retry::RetryLoop,
};

use super::{ApplyOutput, NodeRequest, OutputMode, PlanSummary};

const HOOK_READY_ATTEMPTS: u32 = 60;
const HOOK_READY_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ConvergeOutcome {
    Unchanged,
    Applied(ApplyOutput),
    /// The plan would destroy the only master; the caller migrates through
    /// a multi-master topology instead of applying it.
    DestructiveChangesOnSingleMaster,
}

/// plan, `before_action`, apply, `after_action`.
///
/// The caller persists the returned state before waiting on
/// [`wait_until_ready`], so an interrupted wait never loses it.
pub async fn converge_node(
    ctx: &ConvergeContext,
    request: &NodeRequest,
    mode: OutputMode,
    hook: &dyn InfraActionHook,
) -> Result<ConvergeOutcome, ConvergeError> {
    let node = &request.node_name;
    let executor = ctx.executor();

    let plan = executor.plan(request).await?;
    if !plan.has_changes {
        debug!("Infrastructure of '{node}' is up to date");
        return Ok(ConvergeOutcome::Unchanged);
    }

    if plan.has_destructive_changes {
        warn!(
            "Infrastructure plan for '{node}' has destructive changes: {}",
            describe_destroyed(&plan)
        );
    }

    if hook.before_action(node, &plan).await? == HookDecision::ScaleThroughMultiMaster {
        return Ok(ConvergeOutcome::DestructiveChangesOnSingleMaster);
    }

    ctx.check_interrupted()?;

    info!("Applying infrastructure changes for '{node}'");
    let output = executor.apply(request, mode).await?;
    hook.after_action(node).await?;

    Ok(ConvergeOutcome::Applied(output))
}

pub async fn destroy_node(
    ctx: &ConvergeContext,
    request: &NodeRequest,
    hook: &dyn InfraActionHook,
) -> Result<(), ConvergeError> {
    let node = &request.node_name;

    hook.before_action(node, &PlanSummary::destroy()).await?;
    ctx.check_interrupted()?;

    info!("Destroying infrastructure of '{node}'");
    ctx.executor().destroy(request).await?;
    hook.after_action(node).await
}

pub async fn wait_until_ready(
    ctx: &ConvergeContext,
    node_name: &str,
    hook: &dyn InfraActionHook,
) -> Result<(), ConvergeError> {
    RetryLoop::new(
        format!("Waiting for '{node_name}' to settle"),
        HOOK_READY_ATTEMPTS,
        HOOK_READY_WAIT,
    )
    .break_if(ConvergeError::is_interrupted)
    .with_cancellation(ctx.cancellation())
    .run(|| async {
        match hook.is_ready(node_name).await? {
            true => Ok(()),
            false => Err(ConvergeError::NodesNotReady(vec![node_name.to_owned()])),
        }
    })
    .await
}

fn describe_destroyed(plan: &PlanSummary) -> String {
    match plan.destroyed_resources.is_empty() {
        true => "resources to be replaced".to_owned(),
        false => plan.destroyed_resources.join(", "),
    }
}
