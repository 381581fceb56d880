pub const LOCK_USER_INFO_ANNOTATION: &str = "dhctl.deckhouse.io/lock-user-info";
pub const RESTART_INFRA_DEPLOYMENT_ANNOTATION: &str =
    "dhctl.deckhouse.io/restart-infra-deployment";

/// Set on a node once the given NodeUser has been created on it.
pub fn get_node_user_annotation(user_name: &str) -> String {
    format!("node.deckhouse.io/{user_name}-node-user")
}
