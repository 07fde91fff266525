//! Hook server wiring: state, router and graceful serve loop.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::{any, get};
use axum::Router;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use enclave_common::translate::Translator;

use crate::error::Error;
use crate::proxy::UpstreamClient;
use crate::{endpoints, nodes, proxy};

/// Read access to the host cluster for the hook handlers.
///
/// Hooks never write to the host; this trait is deliberately read-only.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostView: Send + Sync {
    /// All host nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// This virtual cluster's pods in the target namespace
    async fn list_managed_pods(&self) -> Result<Vec<Pod>, Error>;
}

/// [`HostView`] backed by the host kube client.
pub struct KubeHostView {
    client: Client,
    target_namespace: String,
    selector: String,
}

impl KubeHostView {
    pub fn new(client: Client, target_namespace: &str, translator: &Translator) -> Self {
        Self {
            client,
            target_namespace: target_namespace.to_string(),
            selector: translator.managed_by_selector(),
        }
    }
}

#[async_trait]
impl HostView for KubeHostView {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_managed_pods(&self) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.target_namespace);
        Ok(api
            .list(&ListParams::default().labels(&self.selector))
            .await?
            .items)
    }
}

/// Shared state for all hook handlers.
pub struct HookState {
    /// Identity translation for proxied pod requests
    pub translator: Translator,
    /// Host kube client, used for exec/attach/log bridging
    pub host_client: Client,
    /// Read access to the host cluster
    pub host: Arc<dyn HostView>,
    /// Passthrough client for the virtual API server
    pub upstream: Arc<dyn UpstreamClient>,
    /// Base URL of the virtual API server (fixed localhost port)
    pub virtual_upstream: String,
    /// ClusterIP of the `kubernetes` service inside the virtual cluster
    pub virtual_service_ip: String,
    /// Port the virtual API server listens on
    pub api_port: i32,
}

/// Build the hook router. Intercepted endpoints come first; everything
/// else falls through to the virtual API server.
pub fn router(state: Arc<HookState>) -> Router {
    Router::new()
        .route("/api/v1/nodes", get(nodes::list_nodes))
        .route("/api/v1/nodes/{name}", get(nodes::get_node))
        .route(
            "/api/v1/namespaces/{namespace}/endpoints/kubernetes",
            get(endpoints::apiserver_endpoints),
        )
        .route(
            "/apis/discovery.k8s.io/v1/namespaces/{namespace}/endpointslices/kubernetes",
            get(endpoints::apiserver_endpoint_slice),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}/exec",
            any(proxy::pod_exec),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}/attach",
            any(proxy::pod_attach),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}/portforward",
            any(proxy::pod_portforward),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}/log",
            get(proxy::pod_logs),
        )
        .fallback(proxy::passthrough)
        .with_state(state)
}

/// Serve the hook router until cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<HookState>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "hook server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("hook server error: {}", e)))
}
