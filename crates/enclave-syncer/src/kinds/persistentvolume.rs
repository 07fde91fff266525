//! PersistentVolume sync, both shapes:
//!
//! - toHost sync enabled: virtual PVs project onto the host. Identity is
//!   non-deterministic (a user may pin the host PV by annotation), so the
//!   binding persists in the mapping store before the first host write.
//! - toHost sync disabled: host PVs mirror into the virtual cluster under
//!   their own names so virtual PVCs can bind to them.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

use enclave_common::constants::HOST_PV_ANNOTATION;
use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

/// Hostward PV projection with mapping-store identity.
pub struct PersistentVolumeSyncer;

impl KindSyncer for PersistentVolumeSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::persistent_volume()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn cluster_scoped(&self) -> bool {
        true
    }

    fn needs_mapping(&self) -> bool {
        true
    }

    fn host_name_override(&self, v: &DynamicObject) -> Option<String> {
        v.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(HOST_PV_ANNOTATION))
            .filter(|name| !name.is_empty())
            .cloned()
    }

    fn mutation_allowed(&self) -> &'static [&'static str] {
        // the host PV binder manages the claim binding
        &["spec.claimRef"]
    }

    fn desired_host_body(
        &self,
        v: &DynamicObject,
        translator: &Translator,
    ) -> Result<Value, Error> {
        let mut body = v.data.clone();
        if let Some(map) = body.as_object_mut() {
            map.remove("status");
        }

        // a claim reference points at a virtual PVC; rewrite it to the
        // projected identity and drop the instance-specific fields
        if let Some(claim_ref) = body
            .pointer_mut("/spec/claimRef")
            .and_then(Value::as_object_mut)
        {
            let name = claim_ref.get("name").and_then(Value::as_str).map(String::from);
            let namespace = claim_ref
                .get("namespace")
                .and_then(Value::as_str)
                .map(String::from);
            if let (Some(name), Some(namespace)) = (name, namespace) {
                claim_ref.insert(
                    "name".to_string(),
                    Value::String(translator.host_name(&name, &namespace)),
                );
                claim_ref.insert(
                    "namespace".to_string(),
                    Value::String(translator.host_namespace(&namespace)),
                );
            }
            claim_ref.remove("uid");
            claim_ref.remove("resourceVersion");
        }

        Ok(body)
    }

    fn virtual_writeback(&self, p: &DynamicObject) -> Result<Value, Error> {
        match p.data.get("status") {
            Some(status) => Ok(json!({"status": status.clone()})),
            None => Ok(Value::Null),
        }
    }
}

/// Host-authoritative PV mirror used when toHost sync is off.
pub struct PersistentVolumeMirror;

impl KindSyncer for PersistentVolumeMirror {
    fn gvk(&self) -> GroupVersionKind {
        gvks::persistent_volume()
    }

    fn direction(&self) -> Direction {
        Direction::Mirror
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

    fn pv(annotation: Option<&str>) -> DynamicObject {
        let mut v = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({
                "spec": {
                    "capacity": {"storage": "10Gi"},
                    "accessModes": ["ReadWriteOnce"],
                    "claimRef": {
                        "kind": "PersistentVolumeClaim",
                        "name": "data",
                        "namespace": "team-a",
                        "uid": "pvc-uid-1",
                        "resourceVersion": "42",
                    },
                },
                "status": {"phase": "Bound"},
            }),
        };
        v.metadata.name = Some("data-vol".into());
        if let Some(host_pv) = annotation {
            v.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(HOST_PV_ANNOTATION.to_string(), host_pv.to_string());
        }
        v
    }

    #[test]
    fn user_annotation_overrides_host_identity() {
        assert_eq!(
            PersistentVolumeSyncer.host_name_override(&pv(Some("pv-host-0001"))),
            Some("pv-host-0001".to_string())
        );
        assert_eq!(PersistentVolumeSyncer.host_name_override(&pv(None)), None);
        assert_eq!(PersistentVolumeSyncer.host_name_override(&pv(Some(""))), None);
    }

    #[test]
    fn claim_ref_is_rewritten_and_scrubbed() {
        let translator = Translator::new("vc", "host-ns");
        let body = PersistentVolumeSyncer
            .desired_host_body(&pv(None), &translator)
            .unwrap();

        assert_eq!(
            body.pointer("/spec/claimRef/name"),
            Some(&json!("data-x-team-a-x-vc"))
        );
        assert_eq!(body.pointer("/spec/claimRef/namespace"), Some(&json!("host-ns")));
        assert!(body.pointer("/spec/claimRef/uid").is_none());
        assert!(body.pointer("/spec/claimRef/resourceVersion").is_none());
        assert!(body.get("status").is_none());
    }

    #[test]
    fn mirror_copies_the_host_document() {
        let host = pv(None);
        let body = PersistentVolumeMirror.desired_virtual_body(&host).unwrap();
        assert_eq!(body.pointer("/spec/capacity/storage"), Some(&json!("10Gi")));
        assert_eq!(body.pointer("/status/phase"), Some(&json!("Bound")));
    }
}
