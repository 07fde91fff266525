//! Virtual node view.
//!
//! Tenants see only the host nodes their pods actually run on. The view is
//! synthesized from the host informer on every request; there is no
//! virtual-side storage and no host write.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde_json::{json, Value};

use crate::error::Error;
use crate::server::HookState;

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<Arc<HookState>>) -> Result<Json<Value>, Error> {
    let nodes = visible_nodes(&state).await?;
    let items: Vec<Value> = nodes.iter().map(render_node).collect();
    Ok(Json(json!({
        "apiVersion": "v1",
        "kind": "NodeList",
        "metadata": {},
        "items": items,
    })))
}

/// GET /api/v1/nodes/{name}
pub async fn get_node(
    State(state): State<Arc<HookState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, Error> {
    let nodes = visible_nodes(&state).await?;
    let node = nodes
        .iter()
        .find(|node| node.metadata.name.as_deref() == Some(name.as_str()))
        .ok_or_else(|| Error::NotFound(format!("nodes \"{}\" not found", name)))?;
    Ok(Json(render_node(node)))
}

/// Host nodes running at least one of this virtual cluster's pods.
async fn visible_nodes(state: &HookState) -> Result<Vec<Node>, Error> {
    let pods = state.host.list_managed_pods().await?;
    let scheduled: BTreeSet<String> = pods.iter().filter_map(node_of).collect();

    let nodes = state.host.list_nodes().await?;
    Ok(nodes
        .into_iter()
        .filter(|node| {
            node.metadata
                .name
                .as_ref()
                .map(|name| scheduled.contains(name))
                .unwrap_or(false)
        })
        .collect())
}

fn node_of(pod: &Pod) -> Option<String> {
    pod.spec.as_ref()?.node_name.clone()
}

/// Project a host node into the tenant view: identity and capacity
/// survive, host bookkeeping does not.
fn render_node(node: &Node) -> Value {
    let mut rendered = serde_json::to_value(node).unwrap_or_else(|_| json!({}));
    rendered["apiVersion"] = json!("v1");
    rendered["kind"] = json!("Node");

    if let Some(metadata) = rendered.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
        metadata.remove("ownerReferences");
        metadata.remove("resourceVersion");
        metadata.remove("uid");
    }
    if let Some(spec) = rendered.get_mut("spec").and_then(Value::as_object_mut) {
        spec.remove("configSource");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::MockUpstreamClient;
    use crate::server::MockHostView;
    use enclave_common::translate::Translator;
    use k8s_openapi::api::core::v1::{NodeStatus, PodSpec};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some("host-uid".into()),
                resource_version: Some("99".into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(
                    [("cpu".to_string(), Quantity("8".into()))].into_iter().collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_on(node_name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("web-x-ns-x-vc-{}", node_name)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn state_with(nodes: Vec<Node>, pods: Vec<Pod>) -> Arc<HookState> {
        let mut host = MockHostView::new();
        host.expect_list_nodes().returning(move || Ok(nodes.clone()));
        host.expect_list_managed_pods().returning(move || Ok(pods.clone()));

        Arc::new(HookState {
            translator: Translator::new("vc", "host-ns"),
            host_client: kube::Client::try_from(
                kube::Config::new("http://127.0.0.1:8080".parse().unwrap()),
            )
            .unwrap(),
            host: Arc::new(host),
            upstream: Arc::new(MockUpstreamClient::new()),
            virtual_upstream: "https://127.0.0.1:6443".into(),
            virtual_service_ip: "10.96.0.1".into(),
            api_port: 443,
        })
    }

    #[tokio::test]
    async fn only_nodes_running_our_pods_are_visible() {
        let state = state_with(
            vec![node("node-a"), node("node-b"), node("node-c")],
            vec![pod_on("node-a"), pod_on("node-c")],
        )
        .await;

        let Json(list) = list_nodes(State(state)).await.unwrap();
        let names: Vec<&str> = list["items"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|item| item.pointer("/metadata/name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["node-a", "node-c"]);
    }

    #[tokio::test]
    async fn invisible_nodes_read_as_not_found() {
        let state = state_with(vec![node("node-a")], vec![]).await;
        let err = get_node(State(state), Path("node-a".into())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn rendered_nodes_drop_host_bookkeeping() {
        let state = state_with(vec![node("node-a")], vec![pod_on("node-a")]).await;
        let Json(rendered) = get_node(State(state), Path("node-a".into())).await.unwrap();
        assert_eq!(rendered.pointer("/metadata/name"), Some(&json!("node-a")));
        assert_eq!(rendered.pointer("/status/capacity/cpu"), Some(&json!("8")));
        assert!(rendered.pointer("/metadata/uid").is_none());
        assert!(rendered.pointer("/metadata/resourceVersion").is_none());
    }
}
