//! Secret sync. Service-account token secrets never project: those tokens
//! authenticate against the virtual API server and are minted by the
//! virtual control plane, not the host.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{Direction, KindSyncer};
use crate::types::gvks;

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

pub struct SecretSyncer;

impl KindSyncer for SecretSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::secret()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn excluded(&self, v: &DynamicObject) -> bool {
        v.data.get("type").and_then(Value::as_str) == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
    }

    fn desired_host_body(
        &self,
        v: &DynamicObject,
        _translator: &Translator,
    ) -> Result<Value, Error> {
        Ok(v.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(type_: &str) -> DynamicObject {
        let mut v = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({"type": type_, "data": {"password": "aHVudGVyMg=="}}),
        };
        v.metadata.name = Some("db-creds".into());
        v
    }

    #[test]
    fn opaque_secrets_project() {
        let v = secret("Opaque");
        assert!(!SecretSyncer.excluded(&v));

        let translator = Translator::new("vc", "host-ns");
        let body = SecretSyncer.desired_host_body(&v, &translator).unwrap();
        assert_eq!(body.pointer("/type"), Some(&json!("Opaque")));
        assert_eq!(body.pointer("/data/password"), Some(&json!("aHVudGVyMg==")));
    }

    #[test]
    fn service_account_tokens_never_project() {
        assert!(SecretSyncer.excluded(&secret(SERVICE_ACCOUNT_TOKEN_TYPE)));
    }
}
