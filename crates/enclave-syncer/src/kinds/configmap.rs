//! ConfigMap sync: a straight projection. Pods reference the translated
//! names, so the data must land on the host before any referring pod.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use enclave_common::constants::MAPPINGS_CONFIGMAP;
use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

pub struct ConfigMapSyncer;

impl KindSyncer for ConfigMapSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::config_map()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn excluded(&self, v: &DynamicObject) -> bool {
        // never project the syncer's own bookkeeping, and skip the
        // kube-root-ca bundle every namespace gets for free
        v.metadata.name.as_deref() == Some(MAPPINGS_CONFIGMAP)
            || v.metadata.name.as_deref() == Some("kube-root-ca.crt")
    }

    fn desired_host_body(
        &self,
        v: &DynamicObject,
        _translator: &Translator,
    ) -> Result<Value, Error> {
        Ok(v.data.clone())
    }
}
