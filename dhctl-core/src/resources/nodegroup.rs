use kube::{core::DynamicObject, discovery::ApiResource};
use serde_json::Value;

use crate::{kubernetes::unstructured::nested_field, RESOURCE_GROUP};

pub const NODE_TEMPLATE_PATH: [&str; 2] = ["spec", "nodeTemplate"];

pub fn node_group_api_resource() -> ApiResource {
    ApiResource {
        group: RESOURCE_GROUP.to_owned(),
        version: "v1".to_owned(),
        api_version: format!("{RESOURCE_GROUP}/v1"),
        kind: "NodeGroup".to_owned(),
        plural: "nodegroups".to_owned(),
    }
}

/// `.spec.nodeTemplate` of a NodeGroup, `Null` when unset.
pub fn get_node_template(node_group: &DynamicObject) -> Value {
    nested_field(&node_group.data, &NODE_TEMPLATE_PATH)
        .cloned()
        .unwrap_or(Value::Null)
}

pub fn new_node_group(name: &str, data: Value) -> DynamicObject {
    DynamicObject::new(name, &node_group_api_resource()).data(data)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn node_template_defaults_to_null() {
        let group = new_node_group("worker", json!({"spec": {"nodeType": "CloudPermanent"}}));
        assert_eq!(get_node_template(&group), Value::Null);

        let group = new_node_group("worker", json!({"spec": {"nodeTemplate": {"labels": {}}}}));
        assert_eq!(get_node_template(&group), json!({"labels": {}}));
    }
}
