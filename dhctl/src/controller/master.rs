//! Control-plane reconciliation.
//!
//! On top of the generic flow, masters keep etcd quorum while being
//! deleted, record their ssh addresses in the local hosts cache, and move
//! a single-master cluster through three masters when an update would
//! destroy the only one. The migration phase is persisted, so a killed run
//! resumes at the right leg.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dhctl_core::{naming::node_name, MASTER_NODE_GROUP_NAME};
use log::{debug, info, warn};

use crate::{
    context::ConvergeContext,
    error::ConvergeError,
    hooks::{ControlPlaneManagerReadinessChecker, DestroyHook, DestroyKind, MasterUpdateHook},
    infra::{
        pipeline::{converge_node, wait_until_ready, ConvergeOutcome},
        OutputMode,
    },
    state::{
        cache::{load_master_hosts, merge_master_hosts, retain_master_hosts},
        converge::Phase,
        nodes::save_node_state,
    },
};

use super::{
    delete_nodes_in_order, fetch_cloud_config, nodes::wait_nodes_ready, reconcile,
    DesiredNodeGroup, GroupRun, NodeGroupBehavior, ReconcileOutcome, UpdateOutcome,
};

/// Masters the cluster runs on while a destructive change is applied.
pub const MULTI_MASTER_REPLICAS: usize = 3;

#[derive(Default)]
pub struct MasterController {
    node_to_host: BTreeMap<String, String>,
    populated: bool,
    /// Set for the migration legs, which the operator already approved.
    migrating: bool,
}

impl MasterController {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_host(
        &mut self,
        ctx: &ConvergeContext,
        node_name: &str,
        host: &str,
    ) -> Result<(), ConvergeError> {
        self.node_to_host
            .insert(node_name.to_owned(), host.to_owned());

        if ctx.writes_host_cache() {
            merge_master_hosts(
                ctx.cache(),
                &BTreeMap::from([(node_name.to_owned(), host.to_owned())]),
            )?;
        }

        Ok(())
    }

    /// Master name to ssh address, cached hosts first, the rest resolved
    /// through the infra executor.
    async fn populate_node_to_host(
        &mut self,
        ctx: &ConvergeContext,
        run: &GroupRun,
    ) -> Result<(), ConvergeError> {
        if self.populated {
            return Ok(());
        }

        let cached = load_master_hosts(ctx.cache())?;

        for (name, state) in &run.state.nodes {
            if let Some(host) = cached.get(name) {
                self.node_to_host.insert(name.clone(), host.clone());
                continue;
            }

            let request = ctx.node_request(
                MASTER_NODE_GROUP_NAME,
                name,
                Some(state.clone()),
                run.settings.clone(),
                None,
            )?;
            let host = ctx.executor().master_address(&request).await?;
            debug!("Resolved master '{name}' to {host}");
            self.node_to_host.insert(name.clone(), host);
        }

        if ctx.writes_host_cache() {
            merge_master_hosts(ctx.cache(), &self.node_to_host)?;
        }

        self.populated = true;

        Ok(())
    }

    async fn run_leg(
        &mut self,
        ctx: &ConvergeContext,
        desired: &DesiredNodeGroup,
        replicas: usize,
    ) -> Result<(), ConvergeError> {
        let leg = DesiredNodeGroup {
            replicas,
            ..desired.clone()
        };
        let mut run = GroupRun::load(ctx, &leg, true).await?;

        match reconcile(ctx, self, &mut run).await? {
            ReconcileOutcome::Done => Ok(()),
            ReconcileOutcome::ScaleThroughMultiMaster => Err(ConvergeError::State(
                "destructive changes on a single master in the middle of a migration".to_owned(),
            )),
        }
    }

    /// Runs the remaining legs of the migration starting at `phase`.
    async fn migrate(
        &mut self,
        ctx: &ConvergeContext,
        desired: &DesiredNodeGroup,
        phase: Phase,
    ) -> Result<(), ConvergeError> {
        self.migrating = true;

        if phase == Phase::ScaleToMultiMaster {
            info!("Scaling masters up to {MULTI_MASTER_REPLICAS}");
            self.run_leg(ctx, desired, MULTI_MASTER_REPLICAS).await?;
            ctx.set_phase(Phase::ScaleToSingleMaster).await?;
        }

        info!("Scaling masters back down to {}", desired.replicas);
        self.run_leg(ctx, desired, desired.replicas).await?;
        ctx.set_phase(Phase::Empty).await?;

        self.migrating = false;
        info!("Master migration finished");

        Ok(())
    }

    fn confirm_quorum(&self, ctx: &ConvergeContext, run: &GroupRun) -> Result<(), ConvergeError> {
        let total = run.state.nodes.len();
        let desired = run.desired_replicas;

        if desired == 0 {
            return Err(ConvergeError::DeleteAllMasters);
        }

        let needed = quorum(total);
        if desired >= needed || self.migrating {
            return Ok(());
        }

        let question = format!(
            "Scaling masters from {total} to {desired} breaks the etcd quorum ({needed} \
            needed). Do you want to continue?"
        );
        match ctx.confirm(&question) {
            true => Ok(()),
            false => Err(ConvergeError::QuorumWouldBreak {
                desired,
                needed,
                total,
            }),
        }
    }
}

pub fn quorum(total: usize) -> usize {
    total / 2 + 1
}

#[async_trait]
impl NodeGroupBehavior for MasterController {
    async fn prepare(&mut self, ctx: &ConvergeContext, run: &GroupRun) -> Result<(), ConvergeError> {
        if ctx.writes_host_cache() {
            retain_master_hosts(ctx.cache(), run.state.nodes.keys())?;
        }

        self.populate_node_to_host(ctx, run).await
    }

    async fn add_nodes(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        mut indices: Vec<u32>,
    ) -> Result<(), ConvergeError> {
        indices.sort_unstable_by(|left, right| right.cmp(left));

        let mut added = Vec::new();
        let mut internal_ips = Vec::new();

        for index in indices {
            let name = node_name(&ctx.options().cluster_prefix, MASTER_NODE_GROUP_NAME, index);
            let request = ctx.node_request(
                MASTER_NODE_GROUP_NAME,
                &name,
                None,
                run.settings.clone(),
                run.cloud_config.clone(),
            )?;

            info!("Bootstrapping master '{name}'");
            let result = ctx.executor().bootstrap_master(&request).await?;

            let mut record = run.record(&name, result.infrastructure_state.clone());
            record.kube_data_device_path = result.kube_data_device_path.clone();
            save_node_state(ctx, &record).await?;
            run.state
                .nodes
                .insert(name.clone(), result.infrastructure_state);

            self.record_host(ctx, &name, &result.external_ssh_address)?;
            if let Some(ssh) = ctx.ssh() {
                ssh.add_host(&result.external_ssh_address);
            }

            internal_ips.push(result.internal_ip);
            added.push(name);

            ctx.check_interrupted()?;
        }

        let checker = ControlPlaneManagerReadinessChecker::new(ctx);
        wait_nodes_ready(ctx, MASTER_NODE_GROUP_NAME, &added, Some(&checker)).await?;

        run.cloud_config =
            Some(fetch_cloud_config(ctx, MASTER_NODE_GROUP_NAME, &internal_ips).await?);

        Ok(())
    }

    async fn update_node(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        node_name: &str,
    ) -> Result<UpdateOutcome, ConvergeError> {
        let single_master = run.state.nodes.len() == 1;
        let request = ctx.node_request(
            MASTER_NODE_GROUP_NAME,
            node_name,
            run.state.nodes.get(node_name).cloned(),
            run.settings.clone(),
            run.cloud_config.clone(),
        )?;

        let outcome = {
            let hook = MasterUpdateHook::new(ctx, &self.node_to_host, single_master);
            converge_node(ctx, &request, OutputMode::WithOutputs, &hook).await?
        };

        let output = match outcome {
            ConvergeOutcome::Unchanged => return Ok(UpdateOutcome::Unchanged),
            ConvergeOutcome::DestructiveChangesOnSingleMaster => {
                return Ok(UpdateOutcome::ScaleThroughMultiMaster)
            }
            ConvergeOutcome::Applied(output) => output,
        };

        let mut record = run.record(node_name, output.state.clone());
        record.kube_data_device_path = output.kube_data_device_path.clone();
        save_node_state(ctx, &record).await?;
        run.state
            .nodes
            .insert(node_name.to_owned(), output.state);

        match &output.master_address {
            Some(address) => self.record_host(ctx, node_name, address)?,
            None => warn!("Master '{node_name}' didn't report its address after the update"),
        }

        ctx.check_interrupted()?;

        let hook = MasterUpdateHook::new(ctx, &self.node_to_host, single_master);
        wait_until_ready(ctx, node_name, &hook).await?;

        Ok(UpdateOutcome::Updated)
    }

    async fn delete_nodes(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        node_names: &[String],
    ) -> Result<(), ConvergeError> {
        self.confirm_quorum(ctx, run)?;

        let hook = match self.migrating {
            true => DestroyHook::new(ctx, DestroyKind::Master).confirmed(),
            false => DestroyHook::new(ctx, DestroyKind::Master),
        };
        let result = delete_nodes_in_order(ctx, run, node_names, &hook).await;

        self.node_to_host
            .retain(|name, _| run.state.nodes.contains_key(name));

        result
    }

    fn ssh_host(&self, node_name: &str) -> Option<String> {
        self.node_to_host.get(node_name).cloned()
    }
}

/// Reconciles the master group, resuming an interrupted migration first.
pub async fn converge_masters(
    ctx: &ConvergeContext,
    desired: &DesiredNodeGroup,
) -> Result<(), ConvergeError> {
    if desired.replicas == 0 {
        return Err(ConvergeError::DeleteAllMasters);
    }

    let mut controller = MasterController::new();

    let phase = ctx.converge_state().phase;
    if !phase.is_empty() {
        info!("Resuming the master migration at {phase:?}");
        return controller.migrate(ctx, desired, phase).await;
    }

    let mut run = GroupRun::load(ctx, desired, true).await?;
    if reconcile(ctx, &mut controller, &mut run).await? == ReconcileOutcome::Done {
        return Ok(());
    }

    let question = format!(
        "The only master has destructive changes. Migrate through {MULTI_MASTER_REPLICAS} \
        masters to apply them?"
    );
    if !ctx.confirm(&question) {
        return Err(ConvergeError::Declined("master migration".to_owned()));
    }

    ctx.set_phase(Phase::ScaleToMultiMaster).await?;
    controller
        .migrate(ctx, desired, Phase::ScaleToMultiMaster)
        .await
}
