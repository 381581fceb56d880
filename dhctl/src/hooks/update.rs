use std::collections::BTreeMap;

use async_trait::async_trait;
use dhctl_core::MASTER_NODE_GROUP_NAME;
use log::{debug, info, warn};

use crate::{
    context::ConvergeContext, controller::nodes::not_ready_nodes, error::ConvergeError,
    infra::PlanSummary,
};

use super::{
    confirm_plan, ControlPlaneManagerReadinessChecker, HookDecision, InfraActionHook,
};

/// Cloud-permanent update: the operator approves the plan.
pub struct NodeUpdateHook<'a> {
    ctx: &'a ConvergeContext,
}

impl<'a> NodeUpdateHook<'a> {
    pub fn new(ctx: &'a ConvergeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl InfraActionHook for NodeUpdateHook<'_> {
    async fn before_action(
        &self,
        node_name: &str,
        plan: &PlanSummary,
    ) -> Result<HookDecision, ConvergeError> {
        confirm_plan(self.ctx, node_name, plan)?;

        Ok(HookDecision::Proceed)
    }
}

/// Master update: every other master must stay reachable while one of them
/// is being converged.
pub struct MasterUpdateHook<'a> {
    ctx: &'a ConvergeContext,
    node_to_host: &'a BTreeMap<String, String>,
    single_master: bool,
}

impl<'a> MasterUpdateHook<'a> {
    pub fn new(
        ctx: &'a ConvergeContext,
        node_to_host: &'a BTreeMap<String, String>,
        single_master: bool,
    ) -> Self {
        Self {
            ctx,
            node_to_host,
            single_master,
        }
    }

    async fn check_other_masters(&self, node_name: &str) -> Result<(), ConvergeError> {
        let Some(ssh) = self.ctx.ssh() else {
            debug!("No ssh session, skipping the reachability check of other masters");
            return Ok(());
        };

        let others: Vec<(&String, &String)> = self
            .node_to_host
            .iter()
            .filter(|(name, _)| name.as_str() != node_name)
            .collect();

        for (name, host) in &others {
            debug!("Checking that master '{name}' is reachable at {host}");
            ssh.check_host(host).await?;
        }

        if !others.is_empty() {
            info!(
                "Masters reachable while '{node_name}' is converged: {}",
                others
                    .iter()
                    .map(|(name, _)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(())
    }
}

#[async_trait]
impl InfraActionHook for MasterUpdateHook<'_> {
    async fn before_action(
        &self,
        node_name: &str,
        plan: &PlanSummary,
    ) -> Result<HookDecision, ConvergeError> {
        if plan.has_destructive_changes && self.single_master {
            if !self.ctx.destructive_changes_allowed() {
                return Err(ConvergeError::DestructiveChangesDismissed(node_name.to_owned()));
            }

            warn!("Destructive changes on the only master '{node_name}'");
            return Ok(HookDecision::ScaleThroughMultiMaster);
        }

        self.check_other_masters(node_name).await?;
        confirm_plan(self.ctx, node_name, plan)?;

        Ok(HookDecision::Proceed)
    }

    async fn is_ready(&self, node_name: &str) -> Result<bool, ConvergeError> {
        let checker = ControlPlaneManagerReadinessChecker::new(self.ctx);
        let pending = not_ready_nodes(
            self.ctx,
            MASTER_NODE_GROUP_NAME,
            &[node_name.to_owned()],
            Some(&checker),
        )
        .await?;

        Ok(pending.is_empty())
    }
}
