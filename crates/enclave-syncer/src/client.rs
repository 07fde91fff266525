//! Cluster client abstraction.
//!
//! All reads and writes of the sync engine go through the [`ClusterClient`]
//! trait, one instance per side (virtual, host). The real implementation
//! wraps a kube client and serves reads from the informer caches when they
//! are warm; tests inject an in-memory fake (see [`crate::testing`]) or a
//! mockall mock.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams, PropagationPolicy,
};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use enclave_common::constants::FIELD_MANAGER;
use enclave_common::Error;

use crate::cache::KindCache;
use crate::types::{api_resource, gvk_key, ObjKey};

/// Deletion propagation for host-side deletes.
///
/// Foreground is used for owner-referencing parents so dependents are gone
/// before the virtual finalizer releases; background otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    Background,
    Foreground,
}

/// Severity of a recorded event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// An event surfaced on a virtual object
#[derive(Clone, Debug)]
pub struct SyncEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
    pub action: String,
}

impl SyncEvent {
    /// A warning event with the given reason and message
    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            message: message.into(),
            action: "Sync".to_string(),
        }
    }
}

/// Dynamic read/write access to one cluster.
///
/// Get/list are cache-backed in the real implementation; writes always hit
/// the API server. A merge patch that carries `metadata.resourceVersion`
/// is rejected with a conflict when the live object has moved on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a single object, `None` when absent
    async fn get<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Look up an object of the given kind by UID
    async fn get_by_uid(
        &self,
        gvk: &GroupVersionKind,
        uid: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List objects, optionally namespace- and label-filtered
    async fn list<'a, 'b>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        label_selector: Option<&'b str>,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Create an object
    async fn create(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Apply a JSON merge patch
    async fn patch_merge<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object with the given propagation policy
    async fn delete<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error>;

    /// Record an event regarding the given object
    async fn record_event(
        &self,
        regarding: &DynamicObject,
        event: &SyncEvent,
    ) -> Result<(), Error>;
}

/// Real [`ClusterClient`] backed by a kube client and the informer caches
/// registered for each kind.
pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
    caches: dashmap::DashMap<String, Arc<KindCache>>,
}

impl KubeCluster {
    /// Wrap a kube client. `instance` distinguishes event reporters when
    /// several syncers write into the same host namespace.
    pub fn new(client: Client, instance: &str) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: Some(instance.to_string()),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            caches: dashmap::DashMap::new(),
        }
    }

    /// Register the informer cache serving reads for a kind
    pub fn register_cache(&self, gvk: &GroupVersionKind, cache: Arc<KindCache>) {
        self.caches.insert(gvk_key(gvk), cache);
    }

    /// The underlying kube client
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn cache(&self, gvk: &GroupVersionKind) -> Option<Arc<KindCache>> {
        self.caches.get(&gvk_key(gvk)).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        if let Some(cache) = self.cache(gvk) {
            if cache.is_warm() {
                let key = ObjKey {
                    namespace: namespace.map(String::from),
                    name: name.to_string(),
                };
                return Ok(cache.get(&key).map(|obj| (*obj).clone()));
            }
        }

        match self.api(gvk, namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_uid(
        &self,
        gvk: &GroupVersionKind,
        uid: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        if let Some(cache) = self.cache(gvk) {
            if cache.is_warm() {
                return Ok(cache.get_by_uid(uid).map(|obj| (*obj).clone()));
            }
        }

        let listed = self.list(gvk, None, None).await?;
        Ok(listed.into_iter().find(|obj| obj.uid().as_deref() == Some(uid)))
    }

    async fn list<'a, 'b>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        label_selector: Option<&'b str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.api(gvk, namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = obj.metadata.namespace.clone();
        debug!(
            kind = %gvk.kind,
            name = %obj.name_any(),
            namespace = ?namespace,
            "creating object"
        );
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api(gvk, namespace.as_deref()).create(&params, obj).await?)
    }

    async fn patch_merge<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject, Error> {
        debug!(kind = %gvk.kind, name = %name, namespace = ?namespace, "patching object");
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .api(gvk, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await?)
    }

    async fn delete<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error> {
        debug!(
            kind = %gvk.kind,
            name = %name,
            namespace = ?namespace,
            ?propagation,
            "deleting object"
        );
        let params = DeleteParams {
            propagation_policy: Some(match propagation {
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Foreground => PropagationPolicy::Foreground,
            }),
            ..Default::default()
        };
        match self.api(gvk, namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            // already gone: deletion is idempotent
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_event(
        &self,
        regarding: &DynamicObject,
        event: &SyncEvent,
    ) -> Result<(), Error> {
        let reference = ObjectReference {
            api_version: regarding.types.as_ref().map(|t| t.api_version.clone()),
            kind: regarding.types.as_ref().map(|t| t.kind.clone()),
            name: regarding.metadata.name.clone(),
            namespace: regarding.metadata.namespace.clone(),
            uid: regarding.metadata.uid.clone(),
            ..Default::default()
        };
        let kube_event = KubeEvent {
            type_: match event.severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        self.recorder.publish(&kube_event, &reference).await?;
        Ok(())
    }
}
