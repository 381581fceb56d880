use async_trait::async_trait;
use log::info;

use crate::{context::ConvergeContext, error::ConvergeError, infra::PlanSummary};

pub mod destroy;
pub mod readiness;
pub mod update;

pub use destroy::{DestroyHook, DestroyKind};
pub use readiness::ControlPlaneManagerReadinessChecker;
pub use update::{MasterUpdateHook, NodeUpdateHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    /// Skip the apply; the master group migrates through three masters.
    ScaleThroughMultiMaster,
}

/// Wraps every per-node call into the infra executor.
#[async_trait]
pub trait InfraActionHook: Send + Sync {
    async fn before_action(
        &self,
        node_name: &str,
        plan: &PlanSummary,
    ) -> Result<HookDecision, ConvergeError>;

    async fn after_action(&self, _node_name: &str) -> Result<(), ConvergeError> {
        Ok(())
    }

    async fn is_ready(&self, _node_name: &str) -> Result<bool, ConvergeError> {
        Ok(true)
    }

    /// Runs once a destroyed node's object and state are gone.
    async fn after_cleanup(&self, _node_name: &str) -> Result<(), ConvergeError> {
        Ok(())
    }
}

pub struct NoopHook;

#[async_trait]
impl InfraActionHook for NoopHook {
    async fn before_action(&self, _: &str, _: &PlanSummary) -> Result<HookDecision, ConvergeError> {
        Ok(HookDecision::Proceed)
    }
}

/// Extra readiness predicate on top of the `NodeReady` condition.
#[async_trait]
pub trait NodeReadinessChecker: Send + Sync {
    fn name(&self) -> &str;
    async fn is_ready(&self, node_name: &str) -> Result<bool, ConvergeError>;
}

/// Asks the operator about a pending plan. Destructive plans are refused
/// outright when destructive changes are dismissed.
pub(crate) fn confirm_plan(
    ctx: &ConvergeContext,
    node_name: &str,
    plan: &PlanSummary,
) -> Result<(), ConvergeError> {
    if plan.has_destructive_changes && !ctx.destructive_changes_allowed() {
        return Err(ConvergeError::DestructiveChangesDismissed(node_name.to_owned()));
    }

    let question = match plan.has_destructive_changes {
        true => format!(
            "Infrastructure of '{node_name}' has DESTRUCTIVE changes. Do you want to apply them?"
        ),
        false => format!("Infrastructure of '{node_name}' has changes. Do you want to apply them?"),
    };

    if !ctx.confirm(&question) {
        info!("Changes for '{node_name}' were declined");
        return Err(ConvergeError::Declined(format!("changes for '{node_name}'")));
    }

    Ok(())
}
