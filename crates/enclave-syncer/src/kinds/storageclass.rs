//! StorageClass projection: host storage classes surface in the virtual
//! cluster so tenant PVCs can name them. Host-authoritative; virtual edits
//! revert.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

pub struct StorageClassSyncer;

impl KindSyncer for StorageClassSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::storage_class()
    }

    fn direction(&self) -> Direction {
        Direction::Virtualward
    }

    fn cluster_scoped(&self) -> bool {
        true
    }

    fn desired_virtual_body(&self, p: &DynamicObject) -> Result<Value, Error> {
        Ok(p.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projection_is_a_faithful_copy() {
        let mut p = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({
                "provisioner": "ebs.csi.aws.com",
                "parameters": {"type": "gp3"},
                "reclaimPolicy": "Delete",
                "volumeBindingMode": "WaitForFirstConsumer",
            }),
        };
        p.metadata.name = Some("fast-ssd".into());

        let body = StorageClassSyncer.desired_virtual_body(&p).unwrap();
        assert_eq!(body.pointer("/provisioner"), Some(&json!("ebs.csi.aws.com")));
        assert_eq!(body.pointer("/parameters/type"), Some(&json!("gp3")));
    }
}
