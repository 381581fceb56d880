use async_trait::async_trait;
use log::info;

use crate::{
    context::ConvergeContext,
    controller::nodes::drain_node,
    error::ConvergeError,
    infra::PlanSummary,
    state::cache::remove_master_hosts,
};

use super::{HookDecision, InfraActionHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyKind {
    CloudPermanent,
    Master,
}

/// Drains the node before its infrastructure is destroyed. A deleted master
/// is dropped from the hosts cache only after its state is gone.
pub struct DestroyHook<'a> {
    ctx: &'a ConvergeContext,
    kind: DestroyKind,
    confirmed: bool,
}

impl<'a> DestroyHook<'a> {
    pub fn new(ctx: &'a ConvergeContext, kind: DestroyKind) -> Self {
        Self {
            ctx,
            kind,
            confirmed: false,
        }
    }

    /// The operator already agreed to the deletion upstream.
    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

#[async_trait]
impl InfraActionHook for DestroyHook<'_> {
    async fn before_action(
        &self,
        node_name: &str,
        _plan: &PlanSummary,
    ) -> Result<HookDecision, ConvergeError> {
        if !self.confirmed
            && !self
                .ctx
                .confirm(&format!("Node '{node_name}' will be DELETED. Do you want to continue?"))
        {
            return Err(ConvergeError::Declined(format!("deletion of '{node_name}'")));
        }

        drain_node(self.ctx, node_name).await?;

        Ok(HookDecision::Proceed)
    }

    async fn after_cleanup(&self, node_name: &str) -> Result<(), ConvergeError> {
        if self.kind == DestroyKind::Master && self.ctx.writes_host_cache() {
            remove_master_hosts(self.ctx.cache(), &[node_name.to_owned()])?;
            info!("Master '{node_name}' removed from the hosts cache");
        }

        Ok(())
    }
}
