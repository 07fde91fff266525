//! ServiceAccount sync. Only the identity projects; token automounting is
//! disabled host-side because a virtual identity carries no privileges in
//! the host cluster.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

pub struct ServiceAccountSyncer;

impl KindSyncer for ServiceAccountSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::service_account()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn desired_host_body(
        &self,
        _v: &DynamicObject,
        _translator: &Translator,
    ) -> Result<Value, Error> {
        Ok(json!({"automountServiceAccountToken": false}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_projection_never_automounts() {
        let mut v = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({"secrets": [{"name": "builder-token"}], "automountServiceAccountToken": true}),
        };
        v.metadata.name = Some("builder".into());

        let translator = Translator::new("vc", "host-ns");
        let body = ServiceAccountSyncer.desired_host_body(&v, &translator).unwrap();
        assert_eq!(body, json!({"automountServiceAccountToken": false}));
    }
}
