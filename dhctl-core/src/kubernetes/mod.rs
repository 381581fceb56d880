use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    coordination::v1::Lease,
    core::v1::{ConfigMap, Node, Pod, Secret},
};
use kube::core::DynamicObject;
use parking_lot::RwLock;

use crate::resources::crd::{DeckhouseRelease, NodeUser};

pub mod errors;
pub mod operations;
pub mod unstructured;

/// Every cluster read and write the converge flow performs.
///
/// Implemented over a real `kube::Client` by
/// [`operations::KubeClusterApi`]; the trait seam lets the transport be
/// swapped mid-run and lets tests run against an in-memory cluster.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error>;
    async fn list_secrets(&self, namespace: &str, labels: &str)
        -> Result<Vec<Secret>, kube::Error>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, kube::Error>;
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, kube::Error>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<ConfigMap, kube::Error>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, kube::Error>;
    async fn create_lease(&self, lease: &Lease) -> Result<Lease, kube::Error>;
    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, kube::Error>;
    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn list_nodes(&self, labels: Option<&str>) -> Result<Vec<Node>, kube::Error>;
    async fn cordon_node(&self, name: &str) -> Result<(), kube::Error>;
    async fn delete_node(&self, name: &str) -> Result<(), kube::Error>;

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        labels: Option<&str>,
        fields: Option<&str>,
    ) -> Result<Vec<Pod>, kube::Error>;
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), kube::Error>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, kube::Error>;
    async fn merge_patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), kube::Error>;

    async fn get_node_group(&self, name: &str) -> Result<DynamicObject, kube::Error>;
    async fn replace_node_group(&self, node_group: &DynamicObject)
        -> Result<DynamicObject, kube::Error>;
    async fn delete_node_group(&self, name: &str) -> Result<(), kube::Error>;

    async fn create_node_user(&self, node_user: &NodeUser) -> Result<NodeUser, kube::Error>;
    async fn replace_node_user(&self, node_user: &NodeUser) -> Result<NodeUser, kube::Error>;
    async fn delete_node_user(&self, name: &str) -> Result<(), kube::Error>;

    async fn list_deckhouse_releases(&self) -> Result<Vec<DeckhouseRelease>, kube::Error>;
}

/// Shared, swappable handle to the current cluster client.
///
/// Readers clone the inner `Arc` and release the lock immediately, so a
/// swap never waits for in-flight requests.
pub struct KubeClientHolder {
    client: RwLock<Arc<dyn KubeApi>>,
}

impl KubeClientHolder {
    pub fn new(client: Arc<dyn KubeApi>) -> Self {
        Self {
            client: RwLock::new(client),
        }
    }

    pub fn client(&self) -> Arc<dyn KubeApi> {
        self.client.read().clone()
    }

    pub fn set_client(&self, client: Arc<dyn KubeApi>) {
        *self.client.write() = client;
    }
}
