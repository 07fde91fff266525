//! Node projection: virtual nodes are synthesized from host nodes so
//! tenant tooling sees where its pods actually run. Only nodes hosting at
//! least one of this virtual cluster's pods are projected; the rest of the
//! host fleet stays invisible.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use enclave_common::Error;

use super::{Direction, HostFilter, KindSyncer};
use crate::types::gvks;

pub struct NodeSyncer;

impl KindSyncer for NodeSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::node()
    }

    fn direction(&self) -> Direction {
        Direction::Virtualward
    }

    fn cluster_scoped(&self) -> bool {
        true
    }

    fn host_filter(&self) -> HostFilter {
        HostFilter::NodesRunningManagedPods
    }

    fn desired_virtual_body(&self, p: &DynamicObject) -> Result<Value, Error> {
        let mut body = p.data.clone();

        // host config references are meaningless inside the virtual cluster
        if let Some(spec) = body.get_mut("spec").and_then(Value::as_object_mut) {
            spec.remove("configSource");
        }
        if let Some(status) = body.get_mut("status").and_then(Value::as_object_mut) {
            status.remove("config");
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projection_keeps_capacity_and_drops_host_config() {
        let mut p = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({
                "spec": {"podCIDR": "10.244.1.0/24", "configSource": {"configMap": {}}},
                "status": {
                    "capacity": {"cpu": "8", "memory": "32Gi"},
                    "conditions": [{"type": "Ready", "status": "True"}],
                    "config": {"active": {}},
                },
            }),
        };
        p.metadata.name = Some("host-node-7".into());

        let body = NodeSyncer.desired_virtual_body(&p).unwrap();
        assert_eq!(body.pointer("/status/capacity/cpu"), Some(&json!("8")));
        assert_eq!(body.pointer("/spec/podCIDR"), Some(&json!("10.244.1.0/24")));
        assert!(body.pointer("/spec/configSource").is_none());
        assert!(body.pointer("/status/config").is_none());
    }

    #[test]
    fn nodes_are_filtered_to_those_running_our_pods() {
        assert_eq!(NodeSyncer.host_filter(), HostFilter::NodesRunningManagedPods);
    }
}
