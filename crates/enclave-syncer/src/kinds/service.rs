//! Service sync: virtual Services project onto the host so host
//! networking (kube-proxy, endpoints controllers) does the actual work.
//! Cluster IPs, node ports and external IPs are assigned host-side and
//! written back onto the virtual object.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

use enclave_common::constants::MANAGED_BY_LABEL;
use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

pub struct ServiceSyncer;

impl KindSyncer for ServiceSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::service()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn excluded(&self, v: &DynamicObject) -> bool {
        // the apiserver's own service is fabricated by the hook layer
        v.metadata.namespace.as_deref() == Some("default")
            && v.metadata.name.as_deref() == Some("kubernetes")
    }

    fn mutation_allowed(&self) -> &'static [&'static str] {
        &[
            "spec.clusterIP",
            "spec.clusterIPs",
            "spec.externalIPs",
            "spec.ipFamilies",
            "spec.ipFamilyPolicy",
            "spec.ports",
            "spec.healthCheckNodePort",
        ]
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

        if let Some(spec) = body.get_mut("spec").and_then(Value::as_object_mut) {
            // host assigns addresses in its own service CIDR
            spec.remove("clusterIP");
            spec.remove("clusterIPs");

            // scope the selector to this virtual cluster's pods; every
            // projected pod carries the managed-by marker
            if let Some(selector) = spec.get_mut("selector").and_then(Value::as_object_mut) {
                selector.insert(
                    MANAGED_BY_LABEL.to_string(),
                    Value::String(translator.vcluster_name().to_string()),
                );
            }
        }

        Ok(body)
    }

    fn virtual_writeback(&self, p: &DynamicObject) -> Result<Value, Error> {
        let mut spec = serde_json::Map::new();
        for field in ["clusterIP", "clusterIPs", "externalIPs", "ports"] {
            if let Some(value) = p.data.pointer(&format!("/spec/{}", field)) {
                spec.insert(field.to_string(), value.clone());
            }
        }

        let mut patch = json!({});
        if !spec.is_empty() {
            patch["spec"] = Value::Object(spec);
        }
        if let Some(status) = p.data.get("status") {
            patch["status"] = status.clone();
        }
        Ok(patch)
    }
}
