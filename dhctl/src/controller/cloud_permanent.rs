use async_trait::async_trait;
use dhctl_core::naming::node_name;
use futures::future::join_all;
use log::{info, warn};

use crate::{
    context::ConvergeContext,
    error::ConvergeError,
    hooks::{DestroyHook, DestroyKind, NodeUpdateHook},
    infra::{
        pipeline::{converge_node, ConvergeOutcome},
        OutputMode,
    },
    state::nodes::save_node_state,
};

use super::{
    delete_nodes_in_order, nodes::wait_nodes_ready, reconcile, DesiredNodeGroup, GroupRun,
    NodeGroupBehavior, UpdateOutcome,
};

/// Worker groups whose nodes are provisioned by the infra executor.
pub struct CloudPermanentController;

#[async_trait]
impl NodeGroupBehavior for CloudPermanentController {
    async fn add_nodes(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        indices: Vec<u32>,
    ) -> Result<(), ConvergeError> {
        let prefix = &ctx.options().cluster_prefix;
        let requests = indices
            .iter()
            .map(|index| {
                ctx.node_request(
                    &run.name,
                    &node_name(prefix, &run.name, *index),
                    None,
                    run.settings.clone(),
                    run.cloud_config.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let view: &GroupRun = run;
        let results = join_all(requests.iter().map(|request| async move {
            let output = ctx.executor().bootstrap_node(request).await?;
            let record = view.record(&request.node_name, output.state);
            save_node_state(ctx, &record).await?;

            Ok::<_, ConvergeError>(record)
        }))
        .await;

        let mut added = Vec::new();
        let mut failures = Vec::new();
        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(record) => {
                    info!("Node '{}' created", record.node_name);
                    added.push(record.node_name.clone());
                    run.state.nodes.insert(record.node_name, record.state);
                }
                Err(error) => {
                    warn!("Couldn't create node '{}': {error}", request.node_name);
                    failures.push((request.node_name.clone(), error));
                }
            }
        }

        ctx.check_interrupted()?;
        wait_nodes_ready(ctx, &run.name, &added, None).await?;

        ConvergeError::from_node_failures(failures)
    }

    async fn update_node(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        node_name: &str,
    ) -> Result<UpdateOutcome, ConvergeError> {
        let request = ctx.node_request(
            &run.name,
            node_name,
            run.state.nodes.get(node_name).cloned(),
            run.settings.clone(),
            run.cloud_config.clone(),
        )?;

        let output = match converge_node(
            ctx,
            &request,
            OutputMode::OnlyState,
            &NodeUpdateHook::new(ctx),
        )
        .await?
        {
            ConvergeOutcome::Unchanged => return Ok(UpdateOutcome::Unchanged),
            ConvergeOutcome::Applied(output) => output,
            ConvergeOutcome::DestructiveChangesOnSingleMaster => {
                return Err(ConvergeError::State(format!(
                    "'{node_name}' is not a master and can't scale through masters"
                )))
            }
        };

        save_node_state(ctx, &run.record(node_name, output.state.clone())).await?;
        run.state.nodes.insert(node_name.to_owned(), output.state);

        ctx.check_interrupted()?;
        wait_nodes_ready(ctx, &run.name, &[node_name.to_owned()], None).await?;

        Ok(UpdateOutcome::Updated)
    }

    async fn delete_nodes(
        &mut self,
        ctx: &ConvergeContext,
        run: &mut GroupRun,
        node_names: &[String],
    ) -> Result<(), ConvergeError> {
        let hook = DestroyHook::new(ctx, DestroyKind::CloudPermanent);

        delete_nodes_in_order(ctx, run, node_names, &hook).await
    }
}

/// Reconciles a cloud-permanent group. Groups missing from the
/// configuration converge to zero nodes.
pub async fn converge_cloud_permanent_group(
    ctx: &ConvergeContext,
    desired: &DesiredNodeGroup,
    in_configuration: bool,
) -> Result<(), ConvergeError> {
    let mut run = GroupRun::load(ctx, desired, in_configuration).await?;

    reconcile(ctx, &mut CloudPermanentController, &mut run).await?;

    Ok(())
}
