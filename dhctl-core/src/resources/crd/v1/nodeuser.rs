use kube::{core::ObjectMeta, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::resources::labels::get_converge_labels;

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "deckhouse.io",
    version = "v1",
    kind = "NodeUser",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct NodeUserSpec {
    /// numeric user id on the nodes
    pub uid: i64,
    /// authorized key in the OpenSSH format
    pub ssh_public_key: Option<String>,
    /// sha512-crypt hash of the user password
    pub password_hash: String,
    /// whether the user is added to the sudoers
    pub is_sudoer: bool,
    /// node groups the user is created on
    pub node_groups: Vec<String>,
}

impl NodeUser {
    pub fn for_converge(name: &str, spec: NodeUserSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(get_converge_labels()),
                ..Default::default()
            },
            spec,
        }
    }
}
