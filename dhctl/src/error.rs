use std::fmt::Display;

use dhctl_core::{naming::NodeNameError, resources::ResourceGenerationError};
use thiserror::Error;

use crate::{
    infra::InfraError, lock::LockError, nodeuser::NodeUserError, retry::RetryInterrupted,
    ssh::SshError, state::cache::CacheError, version::VersionError,
};

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("Converge was interrupted!")]
    Interrupted,
    #[error("{action}: {source}")]
    KubeApi {
        action: String,
        #[source]
        source: kube::Error,
    },
    #[error("Timed out while trying to {}!", .0)]
    Timeout(String),
    #[error("{}", .0)]
    Infra(#[from] InfraError),
    #[error("{}", .0)]
    Lock(#[from] LockError),
    #[error("{}", .0)]
    Ssh(#[from] SshError),
    #[error("{}", .0)]
    NodeUser(#[from] NodeUserError),
    #[error("{}", .0)]
    Version(#[from] VersionError),
    #[error("Local state cache error: {}", .0)]
    Cache(#[from] CacheError),
    #[error("Invalid node name: {}", .0)]
    NodeName(#[from] NodeNameError),
    #[error("Invalid cluster resource: {}", .0)]
    Resource(#[from] ResourceGenerationError),
    #[error("Invalid converge state: {}", .0)]
    State(String),
    #[error("Couldn't write '{}': {}", .0.display(), .1)]
    ScratchFile(std::path::PathBuf, std::io::Error),
    #[error("Cloud config for the '{group}' node group is not ready yet: {reason}")]
    CloudConfigNotReady { group: String, reason: String },
    #[error("Nodes are not ready yet: {}", .0.join(", "))]
    NodesNotReady(Vec<String>),
    #[error(
        "Cannot scale the master node group down to {desired} replicas: at least {needed} \
        masters are needed to keep the etcd quorum of {total}. Rerun with autoApprove to \
        proceed anyway."
    )]
    QuorumWouldBreak {
        desired: usize,
        needed: usize,
        total: usize,
    },
    #[error(
        "Deleting all master nodes is not allowed! Use 'dhctl destroy' to tear the whole \
        cluster down."
    )]
    DeleteAllMasters,
    #[error("Destructive changes for '{}' were dismissed by autoDismissDestructive!", .0)]
    DestructiveChangesDismissed(String),
    #[error("Operation was declined: {}", .0)]
    Declined(String),
    #[error("{}", format_node_failures(.0))]
    NodeFailures(Vec<(String, ConvergeError)>),
}

impl ConvergeError {
    pub fn kube(action: impl Into<String>, source: kube::Error) -> Self {
        Self::KubeApi {
            action: action.into(),
            source,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        match self {
            ConvergeError::Interrupted => true,
            ConvergeError::Lock(LockError::Interrupted) => true,
            ConvergeError::Infra(InfraError::Interrupted(_)) => true,
            ConvergeError::Ssh(SshError::Interrupted) => true,
            ConvergeError::NodeFailures(failures) => {
                failures.iter().any(|(_, error)| error.is_interrupted())
            }
            _ => false,
        }
    }

    /// Collapses per-node failures into a single error, `Ok` when there are none.
    pub fn from_node_failures(mut failures: Vec<(String, ConvergeError)>) -> Result<(), Self> {
        match failures.len() {
            0 => Ok(()),
            1 if failures[0].1.is_interrupted() => Err(ConvergeError::Interrupted),
            _ => {
                failures.sort_by(|(left, _), (right, _)| left.cmp(right));
                Err(ConvergeError::NodeFailures(failures))
            }
        }
    }
}

impl From<RetryInterrupted> for ConvergeError {
    fn from(_: RetryInterrupted) -> Self {
        ConvergeError::Interrupted
    }
}

fn format_node_failures(failures: &[(String, ConvergeError)]) -> String {
    let mut message = format!("Converge failed for {} node(s):", failures.len());

    for (node, error) in failures {
        append_line(&mut message, node, error);
    }

    message
}

fn append_line(message: &mut String, node: &str, error: impl Display) {
    message.push_str("\n  ");
    message.push_str(node);
    message.push_str(": ");
    message.push_str(&error.to_string());
}
