use async_trait::async_trait;
use dhctl_core::CONTROL_PLANE_NAMESPACE;
use log::debug;

use crate::{
    context::ConvergeContext, controller::nodes::is_pod_ready, error::ConvergeError,
    state::with_deadline,
};

use super::NodeReadinessChecker;

pub const CONTROL_PLANE_MANAGER_LABELS: &str = "app=d8-control-plane-manager";

/// A master is ready once its control-plane-manager pod reports Ready.
pub struct ControlPlaneManagerReadinessChecker<'a> {
    ctx: &'a ConvergeContext,
}

impl<'a> ControlPlaneManagerReadinessChecker<'a> {
    pub fn new(ctx: &'a ConvergeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl NodeReadinessChecker for ControlPlaneManagerReadinessChecker<'_> {
    fn name(&self) -> &str {
        "control-plane-manager"
    }

    async fn is_ready(&self, node_name: &str) -> Result<bool, ConvergeError> {
        let action = format!("list control-plane-manager pods on '{node_name}'");
        let fields = format!("spec.nodeName={node_name}");

        let pods = with_deadline(
            &action,
            self.ctx.kube_client().list_pods(
                Some(CONTROL_PLANE_NAMESPACE),
                Some(CONTROL_PLANE_MANAGER_LABELS),
                Some(&fields),
            ),
        )
        .await?
        .map_err(|error| ConvergeError::kube(&action, error))?;

        let ready = match pods.as_slice() {
            [] => false,
            pods => pods.iter().all(is_pod_ready),
        };
        debug!("control-plane-manager on '{node_name}' ready: {ready}");

        Ok(ready)
    }
}
