//! Apiserver endpoint rewriting.
//!
//! The `kubernetes` Endpoints/EndpointSlice inside the virtual cluster
//! must point at the in-virtual-cluster service address, not the host pod
//! IP the control plane actually listens on; otherwise in-cluster clients
//! route straight into the host network.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::error::Error;
use crate::server::HookState;

/// GET /api/v1/namespaces/{namespace}/endpoints/kubernetes
pub async fn apiserver_endpoints(
    State(state): State<Arc<HookState>>,
    Path(namespace): Path<String>,
) -> Result<Json<Value>, Error> {
    if namespace != "default" {
        return Err(Error::NotFound(format!(
            "endpoints \"kubernetes\" not found in namespace \"{}\"",
            namespace
        )));
    }

    Ok(Json(json!({
        "apiVersion": "v1",
        "kind": "Endpoints",
        "metadata": {
            "name": "kubernetes",
            "namespace": "default",
            "labels": {"endpointslice.kubernetes.io/skip-mirror": "true"},
        },
        "subsets": [{
            "addresses": [{"ip": state.virtual_service_ip}],
            "ports": [{"name": "https", "port": state.api_port, "protocol": "TCP"}],
        }],
    })))
}

/// GET /apis/discovery.k8s.io/v1/namespaces/{namespace}/endpointslices/kubernetes
pub async fn apiserver_endpoint_slice(
    State(state): State<Arc<HookState>>,
    Path(namespace): Path<String>,
) -> Result<Json<Value>, Error> {
    if namespace != "default" {
        return Err(Error::NotFound(format!(
            "endpointslices.discovery.k8s.io \"kubernetes\" not found in namespace \"{}\"",
            namespace
        )));
    }

    Ok(Json(json!({
        "apiVersion": "discovery.k8s.io/v1",
        "kind": "EndpointSlice",
        "metadata": {
            "name": "kubernetes",
            "namespace": "default",
            "labels": {"kubernetes.io/service-name": "kubernetes"},
        },
        "addressType": "IPv4",
        "endpoints": [{
            "addresses": [state.virtual_service_ip],
            "conditions": {"ready": true},
        }],
        "ports": [{"name": "https", "port": state.api_port, "protocol": "TCP"}],
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::MockUpstreamClient;
    use crate::server::MockHostView;
    use enclave_common::translate::Translator;

    fn state() -> Arc<HookState> {
        Arc::new(HookState {
            translator: Translator::new("vc", "host-ns"),
            host_client: kube::Client::try_from(
                kube::Config::new("http://127.0.0.1:8080".parse().unwrap()),
            )
            .unwrap(),
            host: Arc::new(MockHostView::new()),
            upstream: Arc::new(MockUpstreamClient::new()),
            virtual_upstream: "https://127.0.0.1:6443".into(),
            virtual_service_ip: "10.96.0.1".into(),
            api_port: 443,
        })
    }

    #[tokio::test]
    async fn endpoints_point_at_the_virtual_service() {
        let Json(rendered) = apiserver_endpoints(State(state()), Path("default".into()))
            .await
            .unwrap();
        assert_eq!(
            rendered.pointer("/subsets/0/addresses/0/ip"),
            Some(&json!("10.96.0.1"))
        );
        assert_eq!(rendered.pointer("/subsets/0/ports/0/port"), Some(&json!(443)));
    }

    #[tokio::test]
    async fn endpoint_slice_mirrors_the_rewrite() {
        let Json(rendered) = apiserver_endpoint_slice(State(state()), Path("default".into()))
            .await
            .unwrap();
        assert_eq!(
            rendered.pointer("/endpoints/0/addresses/0"),
            Some(&json!("10.96.0.1"))
        );
    }

    #[tokio::test]
    async fn other_namespaces_are_not_intercepted_targets() {
        let err = apiserver_endpoints(State(state()), Path("kube-system".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
