pub mod helpers;
pub mod kubernetes;
pub mod naming;
pub mod resources;

pub const RESOURCE_GROUP: &str = "deckhouse.io";

pub const SYSTEM_NAMESPACE: &str = "d8-system";
pub const CLOUD_INSTANCE_MANAGER_NAMESPACE: &str = "d8-cloud-instance-manager";
pub const CONTROL_PLANE_NAMESPACE: &str = "kube-system";

pub const MASTER_NODE_GROUP_NAME: &str = "master";
pub const DECKHOUSE_DEPLOYMENT_NAME: &str = "deckhouse";
pub const STATE_EXPORTER_DEPLOYMENT_NAME: &str = "terraform-state-exporter";

pub const CONVERGE_LOCK_NAME: &str = "d8-converge-lock";
pub const CONVERGE_STATE_SECRET_NAME: &str = "d8-dhctl-converge-state";
pub const CONVERGE_STATE_SECRET_KEY: &str = "state.json";

pub const PROVIDER_CLUSTER_CONFIGURATION_SECRET_NAME: &str = "d8-provider-cluster-configuration";
pub const INSTALL_DATA_CONFIGMAP_NAME: &str = "install-data";
