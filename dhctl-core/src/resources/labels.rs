use std::collections::BTreeMap;

use crate::MASTER_NODE_GROUP_NAME;

pub const NODE_GROUP_LABEL: &str = "node.deckhouse.io/group";
pub const STATE_SECRET_MARKER_LABEL: &str = "node.deckhouse.io/terraform-state";
pub const STATE_SECRET_NODE_GROUP_LABEL: &str = "node.deckhouse.io/node-group";
pub const STATE_SECRET_NODE_NAME_LABEL: &str = "node.deckhouse.io/node-name";

pub fn get_converge_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("heritage".to_owned(), "deckhouse".to_owned()),
        ("app.kubernetes.io/managed-by".to_owned(), "dhctl".to_owned()),
    ])
}

pub fn get_node_state_labels(node_group: &str, node_name: &str) -> BTreeMap<String, String> {
    get_converge_labels()
        .into_iter()
        .chain([
            (STATE_SECRET_MARKER_LABEL.to_owned(), String::new()),
            (STATE_SECRET_NODE_GROUP_LABEL.to_owned(), node_group.to_owned()),
            (STATE_SECRET_NODE_NAME_LABEL.to_owned(), node_name.to_owned()),
        ])
        .collect()
}

/// Selects the state secrets of every managed node.
pub fn get_all_node_states_selector() -> String {
    STATE_SECRET_MARKER_LABEL.to_owned()
}

/// Selects the state secrets of a single node group.
pub fn get_node_group_states_selector(node_group: &str) -> String {
    format!("{STATE_SECRET_MARKER_LABEL},{STATE_SECRET_NODE_GROUP_LABEL}={node_group}")
}

pub fn get_node_group_selector(node_group: &str) -> String {
    format!("{NODE_GROUP_LABEL}={node_group}")
}

pub fn get_master_nodes_selector() -> String {
    get_node_group_selector(MASTER_NODE_GROUP_NAME)
}
