use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::core::ObjectMeta;

use crate::{
    CLOUD_INSTANCE_MANAGER_NAMESPACE, CONVERGE_STATE_SECRET_KEY, CONVERGE_STATE_SECRET_NAME,
    SYSTEM_NAMESPACE,
};

use super::{
    labels::{get_converge_labels, get_node_state_labels, STATE_SECRET_NODE_GROUP_LABEL},
    ResourceGenerationError,
};

pub const NODE_STATE_SECRET_PREFIX: &str = "d8-node-terraform-state-";
pub const NODE_STATE_KEY: &str = "node-tf-state";
pub const NODE_GROUP_SETTINGS_KEY: &str = "node-group-settings.json";
pub const KUBE_DATA_DEVICE_PATH_KEY: &str = "kube-data-device-path";

pub const CLOUD_CONFIG_KEY: &str = "cloud-config";
pub const API_SERVER_ENDPOINTS_KEY: &str = "apiserverEndpoints";

pub fn get_node_state_secret_name(node_name: &str) -> String {
    format!("{NODE_STATE_SECRET_PREFIX}{node_name}")
}

pub fn get_manual_bootstrap_secret_name(node_group: &str) -> String {
    format!("manual-bootstrap-for-{node_group}")
}

pub fn get_manual_bootstrap_secret_namespace() -> &'static str {
    CLOUD_INSTANCE_MANAGER_NAMESPACE
}

/// Per-node infrastructure state as stored in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStateRecord {
    pub node_group: String,
    pub node_name: String,
    pub state: Vec<u8>,
    pub settings: Option<Vec<u8>>,
    pub kube_data_device_path: Option<String>,
}

impl NodeStateRecord {
    pub fn generate_secret(&self) -> Secret {
        let mut data = BTreeMap::from([(
            NODE_STATE_KEY.to_owned(),
            ByteString(self.state.clone()),
        )]);

        if let Some(settings) = &self.settings {
            data.insert(NODE_GROUP_SETTINGS_KEY.to_owned(), ByteString(settings.clone()));
        }

        if let Some(path) = &self.kube_data_device_path {
            data.insert(
                KUBE_DATA_DEVICE_PATH_KEY.to_owned(),
                ByteString(path.as_bytes().to_vec()),
            );
        }

        Secret {
            metadata: ObjectMeta {
                name: Some(get_node_state_secret_name(&self.node_name)),
                namespace: Some(SYSTEM_NAMESPACE.to_owned()),
                labels: Some(get_node_state_labels(&self.node_group, &self.node_name)),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn from_secret(secret: &Secret) -> Result<Self, ResourceGenerationError> {
        let secret_name = secret
            .metadata
            .name
            .as_deref()
            .ok_or(ResourceGenerationError::MissingMetadataName)?;
        let node_name = secret_name
            .strip_prefix(NODE_STATE_SECRET_PREFIX)
            .ok_or_else(|| ResourceGenerationError::InvalidData(secret_name.to_owned().into()))?
            .to_owned();
        let node_group = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(STATE_SECRET_NODE_GROUP_LABEL))
            .ok_or_else(|| {
                ResourceGenerationError::MissingData(
                    format!("{secret_name}: {STATE_SECRET_NODE_GROUP_LABEL} label").into(),
                )
            })?
            .to_owned();
        let data = secret.data.as_ref().ok_or_else(|| {
            ResourceGenerationError::MissingData(format!("{secret_name}: data").into())
        })?;
        let state = data
            .get(NODE_STATE_KEY)
            .ok_or_else(|| {
                ResourceGenerationError::MissingData(
                    format!("{secret_name}: {NODE_STATE_KEY}").into(),
                )
            })?
            .0
            .clone();

        Ok(Self {
            node_group,
            node_name,
            state,
            settings: data.get(NODE_GROUP_SETTINGS_KEY).map(|value| value.0.clone()),
            kube_data_device_path: data
                .get(KUBE_DATA_DEVICE_PATH_KEY)
                .map(|value| String::from_utf8_lossy(&value.0).into_owned()),
        })
    }
}

pub fn generate_converge_state_secret(state_json: Vec<u8>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(CONVERGE_STATE_SECRET_NAME.to_owned()),
            namespace: Some(SYSTEM_NAMESPACE.to_owned()),
            labels: Some(get_converge_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONVERGE_STATE_SECRET_KEY.to_owned(),
            ByteString(state_json),
        )])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_state_survives_secret_form() {
        let record = NodeStateRecord {
            node_group: "master".into(),
            node_name: "c-master-0".into(),
            state: b"{\"version\":4}".to_vec(),
            settings: None,
            kube_data_device_path: Some("/dev/vdb".into()),
        };

        let secret = record.generate_secret();
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("d8-node-terraform-state-c-master-0")
        );
        assert_eq!(NodeStateRecord::from_secret(&secret).unwrap(), record);
    }

    #[test]
    fn secrets_without_group_label_are_rejected() {
        let mut secret = NodeStateRecord {
            node_group: "worker".into(),
            node_name: "c-worker-0".into(),
            ..Default::default()
        }
        .generate_secret();
        secret.metadata.labels = None;

        assert!(matches!(
            NodeStateRecord::from_secret(&secret),
            Err(ResourceGenerationError::MissingData(_))
        ));
    }
}
