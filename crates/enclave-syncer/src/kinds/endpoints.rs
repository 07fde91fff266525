//! Endpoints sync for manually-managed (selectorless) Services. Target
//! references inside the subsets point at virtual pods and are rewritten
//! to the projected names.
//!
//! The apiserver's own `default/kubernetes` Endpoints never syncs; the
//! hook layer answers those reads with the in-virtual-cluster address.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

pub struct EndpointsSyncer;

impl KindSyncer for EndpointsSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::endpoints()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn excluded(&self, v: &DynamicObject) -> bool {
        v.metadata.namespace.as_deref() == Some("default")
            && v.metadata.name.as_deref() == Some("kubernetes")
    }

    fn mutation_allowed(&self) -> &'static [&'static str] {
        // the host endpoints controller takes over for selector services
        &["subsets"]
    }

    fn desired_host_body(
        &self,
        v: &DynamicObject,
        translator: &Translator,
    ) -> Result<Value, Error> {
        let namespace = v.metadata.namespace.clone().unwrap_or_default();
        let mut body = v.data.clone();

        if let Some(subsets) = body.get_mut("subsets").and_then(Value::as_array_mut) {
            for subset in subsets {
                for addresses_key in ["addresses", "notReadyAddresses"] {
                    let Some(addresses) =
                        subset.get_mut(addresses_key).and_then(Value::as_array_mut)
                    else {
                        continue;
                    };
                    for address in addresses {
                        let Some(target_ref) =
                            address.get_mut("targetRef").and_then(Value::as_object_mut)
                        else {
                            continue;
                        };
                        if target_ref.get("kind").and_then(Value::as_str) != Some("Pod") {
                            continue;
                        }
                        if let Some(name) = target_ref.get("name").and_then(Value::as_str) {
                            let translated = translator.host_name(name, &namespace);
                            target_ref.insert("name".to_string(), Value::String(translated));
                        }
                        target_ref.insert(
                            "namespace".to_string(),
                            Value::String(translator.host_namespace(&namespace)),
                        );
                        target_ref.remove("uid");
                        target_ref.remove("resourceVersion");
                    }
                }
            }
        }

        Ok(body)
    }
}
