use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        coordination::v1::Lease,
        core::v1::{ConfigMap, Node, Pod, Secret},
    },
    serde::{de::DeserializeOwned, Serialize},
};
use kube::{
    api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::DynamicObject,
    Api, Client, Config, Resource,
};
use log::debug;
use serde_json::json;

use crate::{
    helpers::pretty_type_name,
    resources::{
        crd::{DeckhouseRelease, NodeUser},
        nodegroup::node_group_api_resource,
    },
};

use super::{errors::api_error, KubeApi};

/// Name every API server certificate is issued for.
const IN_CLUSTER_SERVER_NAME: &str = "kubernetes";

pub async fn create_local_client(
    config_path: &Option<String>,
    context_name: &Option<String>,
) -> anyhow::Result<Client> {
    let config = load_local_config(config_path, context_name).await?;
    let client = Client::try_from(config)?;

    Ok(client)
}

/// Client for an API server forwarded to `local_port` on the loopback
/// interface. Credentials still come from the kubeconfig.
pub async fn create_forwarded_client(
    config_path: &Option<String>,
    context_name: &Option<String>,
    local_port: u16,
) -> anyhow::Result<Client> {
    let mut config = load_local_config(config_path, context_name).await?;

    debug!(
        "Forwarding {} through 127.0.0.1:{local_port}",
        config.cluster_url
    );
    config.cluster_url = format!("https://127.0.0.1:{local_port}").parse()?;
    config
        .tls_server_name
        .get_or_insert_with(|| IN_CLUSTER_SERVER_NAME.to_owned());

    let client = Client::try_from(config)?;

    Ok(client)
}

async fn load_local_config(
    config_path: &Option<String>,
    context_name: &Option<String>,
) -> anyhow::Result<Config> {
    let config_options = KubeConfigOptions {
        context: context_name.to_owned(),
        ..Default::default()
    };

    let config = match config_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &config_options).await?
        }
        None => Config::from_kubeconfig(&config_options).await?,
    };

    Ok(config)
}

/// [`KubeApi`] backed by a live API server connection.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn node_groups(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &node_group_api_resource())
    }
}

fn require_name<T: Resource>(resource: &T) -> Result<&str, kube::Error> {
    resource.meta().name.as_deref().ok_or_else(|| {
        api_error(
            422,
            "Invalid",
            format!("{} is missing a name!", pretty_type_name::<T>()),
        )
    })
}

fn require_namespace<T: Resource>(resource: &T) -> Result<&str, kube::Error> {
    resource.meta().namespace.as_deref().ok_or_else(|| {
        api_error(
            422,
            "Invalid",
            format!("{} is missing a namespace!", pretty_type_name::<T>()),
        )
    })
}

async fn delete_by_name<T>(api: &Api<T>, name: &str) -> Result<(), kube::Error>
where
    T: Clone + DeserializeOwned + Debug,
{
    debug!("Deleting '{name}' {}...", pretty_type_name::<T>());
    api.delete(name, &DeleteParams::default()).await?;

    Ok(())
}

async fn replace_by_name<T>(api: &Api<T>, resource: &T) -> Result<T, kube::Error>
where
    T: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = require_name(resource)?;
    debug!("Updating '{name}' {}...", pretty_type_name::<T>());

    api.replace(name, &PostParams::default(), resource).await
}

#[async_trait]
impl KubeApi for KubeClusterApi {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        self.namespaced::<Secret>(namespace).get(name).await
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        labels: &str,
    ) -> Result<Vec<Secret>, kube::Error> {
        let list = self
            .namespaced::<Secret>(namespace)
            .list(&ListParams::default().labels(labels))
            .await?;

        Ok(list.items)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        self.namespaced::<Secret>(require_namespace(secret)?)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        replace_by_name(&self.namespaced::<Secret>(require_namespace(secret)?), secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        delete_by_name(&self.namespaced::<Secret>(namespace), name).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, kube::Error> {
        self.namespaced::<ConfigMap>(namespace).get(name).await
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, kube::Error> {
        self.namespaced::<Lease>(namespace).get(name).await
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        self.namespaced::<Lease>(require_namespace(lease)?)
            .create(&PostParams::default(), lease)
            .await
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        replace_by_name(&self.namespaced::<Lease>(require_namespace(lease)?), lease).await
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        delete_by_name(&self.namespaced::<Lease>(namespace), name).await
    }

    async fn list_nodes(&self, labels: Option<&str>) -> Result<Vec<Node>, kube::Error> {
        let mut params = ListParams::default();
        if let Some(labels) = labels {
            params = params.labels(labels);
        }

        Ok(Api::<Node>::all(self.client.clone()).list(&params).await?.items)
    }

    async fn cordon_node(&self, name: &str) -> Result<(), kube::Error> {
        let patch = json!({ "spec": { "unschedulable": true } });

        Api::<Node>::all(self.client.clone())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), kube::Error> {
        delete_by_name(&Api::<Node>::all(self.client.clone()), name).await
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        labels: Option<&str>,
        fields: Option<&str>,
    ) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = match namespace {
            Some(namespace) => self.namespaced(namespace),
            None => Api::all(self.client.clone()),
        };

        let mut params = ListParams::default();
        if let Some(labels) = labels {
            params = params.labels(labels);
        }
        if let Some(fields) = fields {
            params = params.fields(fields);
        }

        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), kube::Error> {
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.namespaced::<Pod>(namespace).evict(name, &params).await?;

        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, kube::Error> {
        self.namespaced::<Deployment>(namespace).get(name).await
    }

    async fn merge_patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), kube::Error> {
        self.namespaced::<Deployment>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;

        Ok(())
    }

    async fn get_node_group(&self, name: &str) -> Result<DynamicObject, kube::Error> {
        self.node_groups().get(name).await
    }

    async fn replace_node_group(
        &self,
        node_group: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = node_group
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| api_error(422, "Invalid", "NodeGroup is missing a name!"))?;

        self.node_groups()
            .replace(name, &PostParams::default(), node_group)
            .await
    }

    async fn delete_node_group(&self, name: &str) -> Result<(), kube::Error> {
        self.node_groups()
            .delete(name, &DeleteParams::default())
            .await?;

        Ok(())
    }

    async fn create_node_user(&self, node_user: &NodeUser) -> Result<NodeUser, kube::Error> {
        Api::<NodeUser>::all(self.client.clone())
            .create(&PostParams::default(), node_user)
            .await
    }

    async fn replace_node_user(&self, node_user: &NodeUser) -> Result<NodeUser, kube::Error> {
        let api = Api::<NodeUser>::all(self.client.clone());
        let name = require_name(node_user)?;

        // updates need the current resource version
        let current = api.get(name).await?;
        let mut node_user = node_user.clone();
        node_user.metadata.resource_version = current.metadata.resource_version;

        replace_by_name(&api, &node_user).await
    }

    async fn delete_node_user(&self, name: &str) -> Result<(), kube::Error> {
        delete_by_name(&Api::<NodeUser>::all(self.client.clone()), name).await
    }

    async fn list_deckhouse_releases(&self) -> Result<Vec<DeckhouseRelease>, kube::Error> {
        Ok(Api::<DeckhouseRelease>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items)
    }
}
