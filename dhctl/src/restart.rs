use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use dhctl_core::{
    kubernetes::errors::is_not_found, resources::annotations::RESTART_INFRA_DEPLOYMENT_ANNOTATION,
};
use log::info;
use serde_json::json;

use crate::{context::ConvergeContext, error::ConvergeError, retry::RetryLoop, state::with_deadline};

const RESTART_ATTEMPTS: u32 = 10;
const RESTART_RETRY_WAIT: Duration = Duration::from_secs(3);

/// Rolls the deployment by touching a pod template annotation.
pub async fn restart_deployment(
    ctx: &ConvergeContext,
    namespace: &str,
    name: &str,
) -> Result<(), ConvergeError> {
    let action = format!("restart deployment '{namespace}/{name}'");

    let restarted = RetryLoop::new(&action, RESTART_ATTEMPTS, RESTART_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            let client = ctx.kube_client();

            match with_deadline(&action, client.get_deployment(namespace, name)).await? {
                Err(error) if is_not_found(&error) => return Ok(false),
                Err(error) => return Err(ConvergeError::kube(&action, error)),
                Ok(_) => {}
            }

            let patch = json!({
                "spec": {
                    "template": {
                        "metadata": {
                            "annotations": {
                                RESTART_INFRA_DEPLOYMENT_ANNOTATION:
                                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
                            }
                        }
                    }
                }
            });

            match with_deadline(&action, client.merge_patch_deployment(namespace, name, &patch))
                .await?
            {
                Ok(()) => Ok(true),
                Err(error) if is_not_found(&error) => Ok(false),
                Err(error) => Err(ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    match restarted {
        true => info!("Deployment '{namespace}/{name}' restarted"),
        false => info!("Deployment '{namespace}/{name}' doesn't exist, nothing to restart"),
    }

    Ok(())
}
