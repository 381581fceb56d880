use std::{future::Future, time::Duration};

use crate::error::ConvergeError;

pub mod cache;
pub mod converge;
pub mod nodes;

pub const API_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a single cluster call under the short per-call deadline.
///
/// The outer error is the deadline; the inner result is left to the caller
/// so not-found and conflict answers can still be told apart.
pub async fn with_deadline<T>(
    action: &str,
    call: impl Future<Output = Result<T, kube::Error>>,
) -> Result<Result<T, kube::Error>, ConvergeError> {
    tokio::time::timeout(API_CALL_TIMEOUT, call)
        .await
        .map_err(|_| ConvergeError::Timeout(action.to_owned()))
}
