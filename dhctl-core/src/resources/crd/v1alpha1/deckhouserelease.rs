use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

pub const DEPLOYED_PHASE: &str = "Deployed";

#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "DeckhouseRelease",
    status = "DeckhouseReleaseStatus",
    derive = "Default"
)]
pub struct DeckhouseReleaseSpec {
    /// release version, e.g. `v1.73.0`
    #[serde(default)]
    pub version: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeckhouseReleaseStatus {
    /// release phase, `Deployed` for the one currently running
    pub phase: Option<String>,
}

impl DeckhouseRelease {
    pub fn is_deployed(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(|phase| phase == DEPLOYED_PHASE)
            .unwrap_or(false)
    }
}
