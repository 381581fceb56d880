//! In-memory collaborators for unit and end-to-end tests.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dhctl_core::{
    kubernetes::{
        errors::{already_exists, not_found},
        KubeApi, KubeClientHolder,
    },
    resources::{
        annotations::get_node_user_annotation,
        crd::{DeckhouseRelease, DeckhouseReleaseSpec, DeckhouseReleaseStatus, NodeUser},
        labels::NODE_GROUP_LABEL,
        nodegroup::new_node_group,
        secret::{
            get_manual_bootstrap_secret_name, get_manual_bootstrap_secret_namespace,
            API_SERVER_ENDPOINTS_KEY, CLOUD_CONFIG_KEY,
        },
    },
    CONTROL_PLANE_NAMESPACE, INSTALL_DATA_CONFIGMAP_NAME, MASTER_NODE_GROUP_NAME,
    SYSTEM_NAMESPACE,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        coordination::v1::Lease,
        core::v1::{
            ConfigMap, Container, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodCondition,
            PodSpec, PodStatus, PodTemplateSpec, Secret,
        },
    },
    ByteString,
};
use kube::core::{DynamicObject, ObjectMeta};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
    context::{Collaborators, ConvergeContext, ConvergeOptions, ConvergeOptionsBuilder},
    hooks::readiness::CONTROL_PLANE_MANAGER_LABELS,
    infra::{
        ApplyOutput, InfraError, InfraExecutor, MasterBootstrapResult, NodeRequest, OutputMode,
        PlanSummary,
    },
    nodeuser::{generate_node_user, GeneratedNodeUser, NodeUserError, NodeUserIssuer},
    prompt::Confirm,
    ssh::{KubeConnector, SshClient, SshClientFactory, SshError, SshSettings},
    state::cache::{MemoryCache, StateCache},
};

type Key = (String, String);

#[derive(Default)]
struct ClusterData {
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    leases: BTreeMap<Key, Lease>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    deployments: BTreeMap<Key, Deployment>,
    node_groups: BTreeMap<String, DynamicObject>,
    node_users: BTreeMap<String, NodeUser>,
    releases: Vec<DeckhouseRelease>,
    evicted: Vec<String>,
    calls: BTreeMap<String, usize>,
    writes: usize,
    failures: BTreeMap<String, VecDeque<kube::Error>>,
}

/// Cluster API backed by maps. Clones returned by [`FakeCluster::client`]
/// share the same objects.
pub struct FakeCluster {
    data: Arc<Mutex<ClusterData>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Arc::default(),
        })
    }

    pub fn client(&self) -> Arc<dyn KubeApi> {
        Arc::new(Self {
            data: Arc::clone(&self.data),
        })
    }

    pub fn holder(&self) -> Arc<KubeClientHolder> {
        Arc::new(KubeClientHolder::new(self.client()))
    }

    /// Makes the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: &str, error: kube::Error) {
        self.data
            .lock()
            .failures
            .entry(operation.to_owned())
            .or_default()
            .push_back(error);
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.data
            .lock()
            .calls
            .get(operation)
            .copied()
            .unwrap_or_default()
    }

    /// Successful mutations made through the API.
    pub fn write_count(&self) -> usize {
        self.data.lock().writes
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.data.lock().leases.get(&key(namespace, name)).cloned()
    }

    pub fn remove_lease(&self, namespace: &str, name: &str) {
        self.data.lock().leases.remove(&key(namespace, name));
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.data.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn put_secret(&self, secret: Secret) {
        self.data
            .lock()
            .secrets
            .insert(meta_key(&secret.metadata), secret);
    }

    pub fn node_user(&self, name: &str) -> Option<NodeUser> {
        self.data.lock().node_users.get(name).cloned()
    }

    pub fn node_users(&self) -> Vec<NodeUser> {
        self.data.lock().node_users.values().cloned().collect()
    }

    pub fn put_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.data.lock().nodes.insert(name, node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.data.lock().nodes.get(name).cloned()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    pub fn is_cordoned(&self, name: &str) -> bool {
        self.node(name)
            .and_then(|node| node.spec)
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    pub fn put_pod(&self, pod: Pod) {
        self.data.lock().pods.insert(meta_key(&pod.metadata), pod);
    }

    pub fn evicted(&self) -> Vec<String> {
        self.data.lock().evicted.clone()
    }

    pub fn put_deployment(&self, namespace: &str, name: &str, image: &str) {
        let deployment = Deployment {
            metadata: object_meta(Some(namespace), name),
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: name.to_owned(),
                            image: Some(image.to_owned()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        self.data
            .lock()
            .deployments
            .insert(key(namespace, name), deployment);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.data
            .lock()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn put_release(&self, version: &str, phase: &str) {
        let name = version.trim().trim_start_matches('v').replace('.', "-");
        let mut release = DeckhouseRelease::new(
            &format!("v{name}"),
            DeckhouseReleaseSpec {
                version: version.to_owned(),
            },
        );
        release.status = Some(DeckhouseReleaseStatus {
            phase: Some(phase.to_owned()),
        });

        self.data.lock().releases.push(release);
    }

    pub fn put_install_version(&self, version: &str) {
        let config_map = ConfigMap {
            metadata: object_meta(Some(SYSTEM_NAMESPACE), INSTALL_DATA_CONFIGMAP_NAME),
            data: Some(BTreeMap::from([("version".to_owned(), version.to_owned())])),
            ..Default::default()
        };

        self.data.lock().config_maps.insert(
            key(SYSTEM_NAMESPACE, INSTALL_DATA_CONFIGMAP_NAME),
            config_map,
        );
    }

    pub fn put_node_group(&self, name: &str, data: Value) {
        self.data
            .lock()
            .node_groups
            .insert(name.to_owned(), new_node_group(name, data));
    }

    pub fn node_group(&self, name: &str) -> Option<DynamicObject> {
        self.data.lock().node_groups.get(name).cloned()
    }

    /// Appends an API server endpoint to the bootstrap secret of `group`.
    pub fn add_api_server_endpoint(&self, group: &str, endpoint: &str) {
        let mut data = self.data.lock();
        let secret_key = key(
            get_manual_bootstrap_secret_namespace(),
            &get_manual_bootstrap_secret_name(group),
        );
        let Some(secret) = data.secrets.get_mut(&secret_key) else {
            return;
        };

        let entries = secret.data.get_or_insert_with(BTreeMap::new);
        let mut endpoints: Vec<String> = entries
            .get(API_SERVER_ENDPOINTS_KEY)
            .and_then(|raw| serde_yaml::from_slice(&raw.0).ok())
            .unwrap_or_default();
        endpoints.push(endpoint.to_owned());
        entries.insert(
            API_SERVER_ENDPOINTS_KEY.to_owned(),
            ByteString(serde_yaml::to_string(&endpoints).unwrap().into_bytes()),
        );
    }

    fn read<T>(
        &self,
        operation: &str,
        action: impl FnOnce(&mut ClusterData) -> Result<T, kube::Error>,
    ) -> Result<T, kube::Error> {
        let mut data = self.data.lock();
        *data.calls.entry(operation.to_owned()).or_default() += 1;

        if let Some(error) = data
            .failures
            .get_mut(operation)
            .and_then(|failures| failures.pop_front())
        {
            return Err(error);
        }

        action(&mut *data)
    }

    fn write<T>(
        &self,
        operation: &str,
        action: impl FnOnce(&mut ClusterData) -> Result<T, kube::Error>,
    ) -> Result<T, kube::Error> {
        self.read(operation, |data| {
            let result = action(data);
            if result.is_ok() {
                data.writes += 1;
            }
            result
        })
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

fn meta_key(metadata: &ObjectMeta) -> Key {
    (
        metadata.namespace.clone().unwrap_or_default(),
        metadata.name.clone().unwrap_or_default(),
    )
}

fn object_meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: namespace.map(str::to_owned),
        ..Default::default()
    }
}

fn get_existing<K: Ord, T: Clone>(
    objects: &BTreeMap<K, T>,
    key: &K,
    kind: &str,
    name: &str,
) -> Result<T, kube::Error> {
    objects.get(key).cloned().ok_or_else(|| not_found(kind, name))
}

fn insert_new<K: Ord, T: Clone>(
    objects: &mut BTreeMap<K, T>,
    key: K,
    object: &T,
    kind: &str,
    name: &str,
) -> Result<T, kube::Error> {
    if objects.contains_key(&key) {
        return Err(already_exists(kind, name));
    }

    objects.insert(key, object.clone());
    Ok(object.clone())
}

fn replace_existing<K: Ord, T: Clone>(
    objects: &mut BTreeMap<K, T>,
    key: &K,
    object: &T,
    kind: &str,
    name: &str,
) -> Result<T, kube::Error> {
    let slot = objects.get_mut(key).ok_or_else(|| not_found(kind, name))?;
    *slot = object.clone();

    Ok(object.clone())
}

fn remove_existing<K: Ord, T>(
    objects: &mut BTreeMap<K, T>,
    key: &K,
    kind: &str,
    name: &str,
) -> Result<(), kube::Error> {
    objects
        .remove(key)
        .map(|_| ())
        .ok_or_else(|| not_found(kind, name))
}

/// `k=v` terms must match, bare `k` terms only need the key.
fn matches_labels(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((label, value)) => labels
                .and_then(|labels| labels.get(label))
                .is_some_and(|actual| actual == value),
            None => labels.is_some_and(|labels| labels.contains_key(term)),
        })
}

fn matches_fields(pod: &Pod, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some(("spec.nodeName", node)) => pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.as_deref())
                == Some(node),
            _ => false,
        })
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Default::default());
    }

    if let Value::Object(object) = target {
        for (name, value) in entries {
            match value {
                Value::Null => {
                    object.remove(name);
                }
                value => merge_patch(object.entry(name.clone()).or_insert(Value::Null), value),
            }
        }
    }
}

fn annotate_masters(data: &mut ClusterData, user_name: &str) {
    let annotation = get_node_user_annotation(user_name);

    for node in data.nodes.values_mut() {
        let is_master = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(NODE_GROUP_LABEL))
            .is_some_and(|group| group == MASTER_NODE_GROUP_NAME);

        if is_master {
            node.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(annotation.clone(), String::new());
        }
    }
}

#[async_trait]
impl KubeApi for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        self.read("get_secret", |data| {
            get_existing(&data.secrets, &key(namespace, name), "secrets", name)
        })
    }

    async fn list_secrets(&self, namespace: &str, labels: &str) -> Result<Vec<Secret>, kube::Error> {
        self.read("list_secrets", |data| {
            Ok(data
                .secrets
                .values()
                .filter(|secret| secret.metadata.namespace.as_deref() == Some(namespace))
                .filter(|secret| matches_labels(secret.metadata.labels.as_ref(), labels))
                .cloned()
                .collect())
        })
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        let (namespace, name) = meta_key(&secret.metadata);
        self.write("create_secret", |data| {
            insert_new(&mut data.secrets, key(&namespace, &name), secret, "secrets", &name)
        })
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        let (namespace, name) = meta_key(&secret.metadata);
        self.write("replace_secret", |data| {
            replace_existing(&mut data.secrets, &key(&namespace, &name), secret, "secrets", &name)
        })
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.write("delete_secret", |data| {
            remove_existing(&mut data.secrets, &key(namespace, name), "secrets", name)
        })
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, kube::Error> {
        self.read("get_config_map", |data| {
            get_existing(&data.config_maps, &key(namespace, name), "configmaps", name)
        })
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, kube::Error> {
        self.read("get_lease", |data| {
            get_existing(&data.leases, &key(namespace, name), "leases", name)
        })
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        let (namespace, name) = meta_key(&lease.metadata);
        self.write("create_lease", |data| {
            insert_new(&mut data.leases, key(&namespace, &name), lease, "leases", &name)
        })
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        let (namespace, name) = meta_key(&lease.metadata);
        self.write("replace_lease", |data| {
            replace_existing(&mut data.leases, &key(&namespace, &name), lease, "leases", &name)
        })
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.write("delete_lease", |data| {
            remove_existing(&mut data.leases, &key(namespace, name), "leases", name)
        })
    }

    async fn list_nodes(&self, labels: Option<&str>) -> Result<Vec<Node>, kube::Error> {
        self.read("list_nodes", |data| {
            Ok(data
                .nodes
                .values()
                .filter(|node| matches_labels(node.metadata.labels.as_ref(), labels.unwrap_or("")))
                .cloned()
                .collect())
        })
    }

    async fn cordon_node(&self, name: &str) -> Result<(), kube::Error> {
        self.write("cordon_node", |data| {
            let node = data
                .nodes
                .get_mut(name)
                .ok_or_else(|| not_found("nodes", name))?;
            node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(true);

            Ok(())
        })
    }

    async fn delete_node(&self, name: &str) -> Result<(), kube::Error> {
        self.write("delete_node", |data| {
            remove_existing(&mut data.nodes, &name.to_owned(), "nodes", name)
        })
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        labels: Option<&str>,
        fields: Option<&str>,
    ) -> Result<Vec<Pod>, kube::Error> {
        self.read("list_pods", |data| {
            Ok(data
                .pods
                .values()
                .filter(|pod| namespace.is_none() || pod.metadata.namespace.as_deref() == namespace)
                .filter(|pod| matches_labels(pod.metadata.labels.as_ref(), labels.unwrap_or("")))
                .filter(|pod| matches_fields(pod, fields.unwrap_or("")))
                .cloned()
                .collect())
        })
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: u32,
    ) -> Result<(), kube::Error> {
        self.write("evict_pod", |data| {
            remove_existing(&mut data.pods, &key(namespace, name), "pods", name)?;
            data.evicted.push(format!("{namespace}/{name}"));

            Ok(())
        })
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, kube::Error> {
        self.read("get_deployment", |data| {
            get_existing(&data.deployments, &key(namespace, name), "deployments", name)
        })
    }

    async fn merge_patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), kube::Error> {
        self.write("merge_patch_deployment", |data| {
            let deployment = data
                .deployments
                .get_mut(&key(namespace, name))
                .ok_or_else(|| not_found("deployments", name))?;

            let mut document = serde_json::to_value(&*deployment).map_err(kube::Error::SerdeError)?;
            merge_patch(&mut document, patch);
            *deployment = serde_json::from_value(document).map_err(kube::Error::SerdeError)?;

            Ok(())
        })
    }

    async fn get_node_group(&self, name: &str) -> Result<DynamicObject, kube::Error> {
        self.read("get_node_group", |data| {
            get_existing(&data.node_groups, &name.to_owned(), "nodegroups", name)
        })
    }

    async fn replace_node_group(
        &self,
        node_group: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = node_group.metadata.name.clone().unwrap_or_default();
        self.write("replace_node_group", |data| {
            replace_existing(&mut data.node_groups, &name, node_group, "nodegroups", &name)
        })
    }

    async fn delete_node_group(&self, name: &str) -> Result<(), kube::Error> {
        self.write("delete_node_group", |data| {
            remove_existing(&mut data.node_groups, &name.to_owned(), "nodegroups", name)
        })
    }

    async fn create_node_user(&self, node_user: &NodeUser) -> Result<NodeUser, kube::Error> {
        let name = node_user.metadata.name.clone().unwrap_or_default();
        self.write("create_node_user", |data| {
            let created = insert_new(&mut data.node_users, name.clone(), node_user, "nodeusers", &name)?;
            annotate_masters(data, &name);

            Ok(created)
        })
    }

    async fn replace_node_user(&self, node_user: &NodeUser) -> Result<NodeUser, kube::Error> {
        let name = node_user.metadata.name.clone().unwrap_or_default();
        self.write("replace_node_user", |data| {
            let replaced =
                replace_existing(&mut data.node_users, &name, node_user, "nodeusers", &name)?;
            annotate_masters(data, &name);

            Ok(replaced)
        })
    }

    async fn delete_node_user(&self, name: &str) -> Result<(), kube::Error> {
        self.write("delete_node_user", |data| {
            remove_existing(&mut data.node_users, &name.to_owned(), "nodeusers", name)
        })
    }

    async fn list_deckhouse_releases(&self) -> Result<Vec<DeckhouseRelease>, kube::Error> {
        self.read("list_deckhouse_releases", |data| Ok(data.releases.clone()))
    }
}

fn ready_condition(ready: bool) -> String {
    match ready {
        true => "True".to_owned(),
        false => "False".to_owned(),
    }
}

pub fn ready_node(name: &str, group: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(BTreeMap::from([(
                NODE_GROUP_LABEL.to_owned(),
                group.to_owned(),
            )])),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_owned(),
                status: ready_condition(true),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn pod(namespace: &str, name: &str, node: &str, ready: bool) -> Pod {
    Pod {
        metadata: object_meta(Some(namespace), name),
        spec: Some(PodSpec {
            node_name: Some(node.to_owned()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_owned()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_owned(),
                status: ready_condition(ready),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn running_pod(namespace: &str, name: &str, node: &str) -> Pod {
    pod(namespace, name, node, true)
}

pub fn control_plane_manager_pod(node: &str, ready: bool) -> Pod {
    let mut pod = pod(
        CONTROL_PLANE_NAMESPACE,
        &format!("d8-control-plane-manager-{node}"),
        node,
        ready,
    );
    let (label, value) = CONTROL_PLANE_MANAGER_LABELS
        .split_once('=')
        .unwrap_or((CONTROL_PLANE_MANAGER_LABELS, ""));
    pod.metadata.labels = Some(BTreeMap::from([(label.to_owned(), value.to_owned())]));

    pod
}

pub fn bootstrap_secret(group: &str, cloud_config: &[u8], endpoints: &[&str]) -> Secret {
    Secret {
        metadata: object_meta(
            Some(get_manual_bootstrap_secret_namespace()),
            &get_manual_bootstrap_secret_name(group),
        ),
        data: Some(BTreeMap::from([
            (CLOUD_CONFIG_KEY.to_owned(), ByteString(cloud_config.to_vec())),
            (
                API_SERVER_ENDPOINTS_KEY.to_owned(),
                ByteString(serde_yaml::to_string(endpoints).unwrap().into_bytes()),
            ),
        ])),
        ..Default::default()
    }
}

static NODE_USER: Lazy<GeneratedNodeUser> = Lazy::new(|| generate_node_user().unwrap());

/// RSA generation is slow, so tests share one generated user.
pub fn test_node_user() -> GeneratedNodeUser {
    NODE_USER.clone()
}

/// Hands out the shared test user under a fresh name each time.
#[derive(Default)]
pub struct FakeIssuer {
    issued: AtomicUsize,
}

impl NodeUserIssuer for FakeIssuer {
    fn issue(&self) -> Result<GeneratedNodeUser, NodeUserError> {
        let mut user = test_node_user();
        let name = format!(
            "{}{:08x}",
            crate::nodeuser::NODE_USER_NAME_PREFIX,
            self.issued.fetch_add(1, Ordering::SeqCst)
        );

        user.node_user.metadata.name = Some(name.clone());
        user.credentials.name = name;

        Ok(user)
    }
}

fn master_address(index: u32) -> String {
    format!("203.0.113.{}", 10 + index)
}

fn master_internal_ip(index: u32) -> String {
    format!("192.168.0.{}", 10 + index)
}

/// Records every executor call and materializes created nodes in the
/// fake cluster.
pub struct FakeExecutor {
    cluster: Arc<FakeCluster>,
    plans: Mutex<BTreeMap<String, PlanSummary>>,
    log: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            plans: Mutex::default(),
            log: Mutex::default(),
        }
    }

    /// Plan returned for `node` until it's applied.
    pub fn set_plan(&self, node: &str, plan: PlanSummary) {
        self.plans.lock().insert(node.to_owned(), plan);
    }

    pub fn actions(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Actions that change infrastructure.
    pub fn mutations(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter(|action| !action.starts_with("plan ") && !action.starts_with("master-address "))
            .collect()
    }

    fn record(&self, action: &str, request: &NodeRequest) {
        self.log
            .lock()
            .push(format!("{action} {}", request.node_name));
    }
}

#[async_trait]
impl InfraExecutor for FakeExecutor {
    async fn plan(&self, request: &NodeRequest) -> Result<PlanSummary, InfraError> {
        self.record("plan", request);

        Ok(self
            .plans
            .lock()
            .get(&request.node_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply(
        &self,
        request: &NodeRequest,
        _mode: OutputMode,
    ) -> Result<ApplyOutput, InfraError> {
        self.record("apply", request);
        self.plans.lock().remove(&request.node_name);

        let state = format!("{}-applied", request.node_name).into_bytes();
        if request.node_group != MASTER_NODE_GROUP_NAME {
            return Ok(ApplyOutput {
                state,
                ..Default::default()
            });
        }

        Ok(ApplyOutput {
            state,
            master_address: Some(master_address(request.node_index)),
            internal_ip: Some(master_internal_ip(request.node_index)),
            kube_data_device_path: Some("/dev/vdb".to_owned()),
        })
    }

    async fn bootstrap_node(&self, request: &NodeRequest) -> Result<ApplyOutput, InfraError> {
        self.record("bootstrap", request);
        self.cluster
            .put_node(ready_node(&request.node_name, &request.node_group));

        Ok(ApplyOutput {
            state: format!("{}-v1", request.node_name).into_bytes(),
            ..Default::default()
        })
    }

    async fn bootstrap_master(
        &self,
        request: &NodeRequest,
    ) -> Result<MasterBootstrapResult, InfraError> {
        self.record("bootstrap-master", request);

        let internal_ip = master_internal_ip(request.node_index);
        self.cluster
            .put_node(ready_node(&request.node_name, MASTER_NODE_GROUP_NAME));
        self.cluster
            .put_pod(control_plane_manager_pod(&request.node_name, true));
        self.cluster
            .add_api_server_endpoint(MASTER_NODE_GROUP_NAME, &format!("{internal_ip}:6443"));

        Ok(MasterBootstrapResult {
            infrastructure_state: format!("{}-v1", request.node_name).into_bytes(),
            external_ssh_address: master_address(request.node_index),
            internal_ip,
            kube_data_device_path: Some("/dev/vdb".to_owned()),
        })
    }

    async fn destroy(&self, request: &NodeRequest) -> Result<(), InfraError> {
        self.record("destroy", request);
        Ok(())
    }

    async fn master_address(&self, request: &NodeRequest) -> Result<String, InfraError> {
        self.record("master-address", request);
        Ok(master_address(request.node_index))
    }
}

#[derive(Default)]
struct SshWorld {
    unreachable: BTreeSet<String>,
    checked: Vec<String>,
    agent_keys: Vec<PathBuf>,
}

/// Ssh session factory; every session it creates shares the same view of
/// which hosts answer.
#[derive(Default)]
pub struct FakeSsh {
    world: Arc<Mutex<SshWorld>>,
}

impl FakeSsh {
    pub fn unreachable(&self, host: &str) {
        self.world.lock().unreachable.insert(host.to_owned());
    }

    /// Every `check_host` call, failed ones included.
    pub fn checked_hosts(&self) -> Vec<String> {
        self.world.lock().checked.clone()
    }

    pub fn agent_keys(&self) -> Vec<PathBuf> {
        self.world.lock().agent_keys.clone()
    }

    pub fn session(&self, settings: SshSettings) -> Arc<FakeSshClient> {
        Arc::new(FakeSshClient {
            world: Arc::clone(&self.world),
            settings: Mutex::new(settings),
            current: Mutex::new(None),
        })
    }
}

impl SshClientFactory for FakeSsh {
    fn create(&self, settings: SshSettings) -> Arc<dyn SshClient> {
        self.session(settings)
    }
}

pub struct FakeSshClient {
    world: Arc<Mutex<SshWorld>>,
    settings: Mutex<SshSettings>,
    current: Mutex<Option<String>>,
}

#[async_trait]
impl SshClient for FakeSshClient {
    fn settings(&self) -> SshSettings {
        self.settings.lock().clone()
    }

    fn current_host(&self) -> Option<String> {
        self.current.lock().clone()
    }

    fn add_host(&self, host: &str) {
        let mut settings = self.settings.lock();
        if !settings.hosts.iter().any(|known| known == host) {
            settings.hosts.push(host.to_owned());
        }
    }

    async fn start(&self) -> Result<(), SshError> {
        let hosts = self.settings.lock().hosts.clone();
        let reachable = {
            let world = self.world.lock();
            hosts
                .iter()
                .find(|host| !world.unreachable.contains(*host))
                .cloned()
        };

        match reachable {
            Some(host) => {
                *self.current.lock() = Some(host);
                Ok(())
            }
            None => Err(SshError::NoReachableHost(hosts)),
        }
    }

    async fn stop(&self) {
        *self.current.lock() = None;
    }

    async fn check_host(&self, host: &str) -> Result<(), SshError> {
        let mut world = self.world.lock();
        world.checked.push(host.to_owned());

        match world.unreachable.contains(host) {
            true => Err(SshError::Unreachable {
                host: host.to_owned(),
                reason: "connection refused".to_owned(),
            }),
            false => Ok(()),
        }
    }

    async fn add_key_to_agent(&self, key_path: &Path) -> Result<(), SshError> {
        self.world.lock().agent_keys.push(key_path.to_owned());
        Ok(())
    }
}

/// Hands out clients of the fake cluster as if tunnelled over ssh.
pub struct FakeConnector {
    cluster: Arc<FakeCluster>,
    connections: AtomicUsize,
    refusing: AtomicBool,
}

impl FakeConnector {
    /// Successful connections so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every following `connect` fails.
    pub fn refuse_connections(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl KubeConnector for FakeConnector {
    async fn connect(&self, _ssh: Arc<dyn SshClient>) -> Result<Arc<dyn KubeApi>, SshError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(SshError::KubeConnect("connection refused".to_owned()));
        }

        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.cluster.client())
    }

    async fn stop(&self) {}
}

/// One fake cluster plus everything a [`ConvergeContext`] needs around it.
/// Contexts built from the same environment share all state.
pub struct TestEnvironment {
    pub cluster: Arc<FakeCluster>,
    pub executor: Arc<FakeExecutor>,
    pub ssh: Arc<FakeSsh>,
    pub connector: Arc<FakeConnector>,
    pub cache: Arc<MemoryCache>,
    pub cancellation: CancellationToken,
    issuer: Arc<FakeIssuer>,
    session: Arc<dyn SshClient>,
    prompts: Arc<Mutex<Vec<String>>>,
    answer: bool,
    options: ConvergeOptions,
    _scratch: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let cluster = FakeCluster::new();
        let ssh = Arc::new(FakeSsh::default());
        let scratch = TempDir::new().unwrap();
        let session: Arc<dyn SshClient> = ssh.session(SshSettings {
            hosts: vec![master_address(0)],
            private_keys: vec!["/home/operator/.ssh/id_rsa".into()],
            ..Default::default()
        });
        let options = ConvergeOptionsBuilder::default()
            .cluster_prefix("cluster")
            .tool_version("dev")
            .scratch_dir(scratch.path().join("dhctl"))
            .build()
            .unwrap();

        Self {
            executor: Arc::new(FakeExecutor::new(Arc::clone(&cluster))),
            connector: Arc::new(FakeConnector {
                cluster: Arc::clone(&cluster),
                connections: AtomicUsize::new(0),
                refusing: AtomicBool::new(false),
            }),
            cluster,
            ssh,
            cache: Arc::new(MemoryCache::new()),
            cancellation: CancellationToken::new(),
            issuer: Arc::new(FakeIssuer::default()),
            session,
            prompts: Arc::default(),
            answer: true,
            options,
            _scratch: scratch,
        }
    }

    /// Every prompt is answered with "no".
    pub fn declining(mut self) -> Self {
        self.answer = false;
        self
    }

    pub fn with_options(mut self, update: impl FnOnce(&mut ConvergeOptions)) -> Self {
        update(&mut self.options);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn context(&self) -> ConvergeContext {
        let prompts = Arc::clone(&self.prompts);
        let answer = self.answer;
        let confirm: Confirm = Arc::new(move |message: &str| {
            prompts.lock().push(message.to_owned());
            answer
        });

        ConvergeContext::new(
            Collaborators {
                kube: self.cluster.holder(),
                ssh: Some(Arc::clone(&self.session)),
                ssh_factory: Arc::clone(&self.ssh) as Arc<dyn SshClientFactory>,
                kube_connector: Arc::clone(&self.connector) as Arc<dyn KubeConnector>,
                executor: Arc::clone(&self.executor) as Arc<dyn InfraExecutor>,
                cache: Arc::clone(&self.cache) as Arc<dyn StateCache>,
                issuer: Arc::clone(&self.issuer) as Arc<dyn NodeUserIssuer>,
                confirm,
            },
            self.options.clone(),
            self.cancellation.clone(),
        )
    }
}
