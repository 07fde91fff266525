//! In-memory test doubles for the sync engine.
//!
//! [`FakeCluster`] implements [`ClusterClient`] over a plain map with
//! enough API-server behavior for the state machine to be exercised
//! realistically: AlreadyExists on create, resourceVersion preconditions
//! on patch, finalizer-aware deletion. [`TestHarness`] wires two fakes
//! into a full [`SyncContext`] with the kind registry, so tests describe
//! initial state on both sides, run reconciles, and compare outcomes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::core::ErrorResponse;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use enclave_common::config::SyncerConfig;
use enclave_common::constants::{
    APPLY_ANNOTATION, LABELS_APPLY_ANNOTATION, LAST_APPLIED_ANNOTATION, MANAGED_BY_LABEL,
    OWNER_SET_UID_ANNOTATION,
};
use enclave_common::translate::Translator;
use enclave_common::Error;

use crate::client::{ClusterClient, EventSeverity, Propagation, SyncEvent};
use crate::context::SyncContext;
use crate::kinds::registry;
use crate::mappings::MappingStore;
use crate::runtime::queue::WorkQueue;
use crate::runtime::{KeyHandler, Outcome};
use crate::sync::machine::KindController;
use crate::sync::merge::apply_merge_patch;
use crate::types::{gvk_key, ObjKey};

/// An event recorded against an object by the fake
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub regarding: String,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

/// In-memory [`ClusterClient`].
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<String, DynamicObject>>,
    events: Mutex<Vec<RecordedEvent>>,
    deletions: Mutex<Vec<(String, Propagation)>>,
    writes: AtomicUsize,
    counter: AtomicU64,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed objects; assigns UIDs and resourceVersions to anything missing
    /// them, as a real API server would have
    pub fn seed(&self, objects: Vec<DynamicObject>) {
        let mut store = self.objects.lock();
        for mut obj in objects {
            if obj.metadata.uid.is_none() {
                obj.metadata.uid = Some(self.next_uid());
            }
            if obj.metadata.resource_version.is_none() {
                obj.metadata.resource_version = Some("1".to_string());
            }
            store.insert(storage_key_of(&obj), obj);
        }
    }

    /// All stored objects of a kind, sorted by key
    pub fn all(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        let prefix = format!("{}|", gvk_key(gvk));
        self.objects
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Number of mutating calls observed (create, patch, delete)
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// `(key, propagation)` pairs of delete calls observed
    pub fn deletions(&self) -> Vec<(String, Propagation)> {
        self.deletions.lock().clone()
    }

    fn next_uid(&self) -> String {
        format!("uid-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn storage_key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> String {
        format!("{}|{}/{}", gvk_key(gvk), namespace.unwrap_or(""), name)
    }

    fn not_found(name: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("{} not found", name),
                reason: "NotFound".into(),
                code: 404,
            }),
        }
    }
}

fn storage_key_of(obj: &DynamicObject) -> String {
    let gvk = gvk_of(obj);
    FakeCluster::storage_key(&gvk, obj.metadata.namespace.as_deref(), &obj.name_any())
}

/// GVK of an object from its TypeMeta; harness objects always carry one.
pub fn gvk_of(obj: &DynamicObject) -> GroupVersionKind {
    let Some(types) = obj.types.as_ref() else {
        panic!("test object {} is missing TypeMeta", obj.name_any());
    };
    match types.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &types.kind),
        None => GroupVersionKind::gvk("", &types.api_version, &types.kind),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let key = Self::storage_key(gvk, namespace, name);
        Ok(self.objects.lock().get(&key).cloned())
    }

    async fn get_by_uid(
        &self,
        gvk: &GroupVersionKind,
        uid: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self
            .all(gvk)
            .into_iter()
            .find(|obj| obj.metadata.uid.as_deref() == Some(uid)))
    }

    async fn list<'a, 'b>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        label_selector: Option<&'b str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let selector: Option<(&str, &str)> = label_selector.and_then(|s| s.split_once('='));
        Ok(self
            .all(gvk)
            .into_iter()
            .filter(|obj| match namespace {
                Some(ns) => obj.metadata.namespace.as_deref() == Some(ns),
                None => true,
            })
            .filter(|obj| match selector {
                Some((key, value)) => obj
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(key))
                    .map(|stored| stored == value)
                    .unwrap_or(false),
                None => true,
            })
            .collect())
    }

    async fn create(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = Self::storage_key(gvk, obj.metadata.namespace.as_deref(), &obj.name_any());

        let mut store = self.objects.lock();
        if store.contains_key(&key) {
            return Err(Error::Kube {
                source: kube::Error::Api(ErrorResponse {
                    status: "Failure".into(),
                    message: format!("{} already exists", obj.name_any()),
                    reason: "AlreadyExists".into(),
                    code: 409,
                }),
            });
        }

        let mut created = obj.clone();
        if created.metadata.uid.is_none() {
            created.metadata.uid = Some(self.next_uid());
        }
        created.metadata.resource_version = Some("1".to_string());
        store.insert(key, created.clone());
        Ok(created)
    }

    async fn patch_merge<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = Self::storage_key(gvk, namespace, name);

        let mut store = self.objects.lock();
        let current = store.get(&key).ok_or_else(|| Self::not_found(name))?.clone();

        // optimistic concurrency: an explicit resourceVersion must match
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(Error::Kube {
                    source: kube::Error::Api(ErrorResponse {
                        status: "Failure".into(),
                        message: format!("the object has been modified: {}", name),
                        reason: "Conflict".into(),
                        code: 409,
                    }),
                });
            }
        }

        let rv: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(1);

        let mut doc = serde_json::to_value(&current)
            .map_err(|e| Error::serialization(e.to_string()))?;
        apply_merge_patch(&mut doc, patch);
        let mut updated: DynamicObject = serde_json::from_value(doc)
            .map_err(|e| Error::serialization(e.to_string()))?;
        updated.metadata.resource_version = Some((rv + 1).to_string());

        // the API server removes a deleting object once its finalizers drain
        let deleting = updated.metadata.deletion_timestamp.is_some();
        let finalizers_empty = updated
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true);
        if deleting && finalizers_empty {
            store.remove(&key);
        } else {
            store.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn delete<'a>(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&'a str>,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = Self::storage_key(gvk, namespace, name);
        self.deletions.lock().push((key.clone(), propagation));

        let mut store = self.objects.lock();
        let Some(current) = store.get_mut(&key) else {
            return Ok(());
        };

        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            current.metadata.deletion_timestamp = Some(Time(Utc::now()));
        } else {
            store.remove(&key);
        }
        Ok(())
    }

    async fn record_event(
        &self,
        regarding: &DynamicObject,
        event: &SyncEvent,
    ) -> Result<(), Error> {
        self.events.lock().push(RecordedEvent {
            regarding: format!(
                "{}/{}",
                regarding.metadata.namespace.as_deref().unwrap_or(""),
                regarding.name_any()
            ),
            severity: event.severity,
            reason: event.reason.clone(),
            message: event.message.clone(),
        });
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A full sync setup around two fakes: context, mapping store, and one
/// controller per registered kind.
pub struct TestHarness {
    pub virtual_cluster: Arc<FakeCluster>,
    pub host_cluster: Arc<FakeCluster>,
    pub ctx: Arc<SyncContext>,
    controllers: Vec<(GroupVersionKind, KindController)>,
}

impl TestHarness {
    /// Harness for virtual cluster `vc` targeting host namespace `host-ns`
    pub fn new(config: SyncerConfig) -> Self {
        Self::with_clusters(config, Arc::new(FakeCluster::new()), Arc::new(FakeCluster::new()))
    }

    /// Harness around pre-existing fakes; used to simulate syncer restarts
    /// against surviving cluster state
    pub fn with_clusters(
        config: SyncerConfig,
        virtual_cluster: Arc<FakeCluster>,
        host_cluster: Arc<FakeCluster>,
    ) -> Self {
        let translator = Arc::new(Translator::new("vc", "host-ns"));
        let mappings = Arc::new(MappingStore::new());

        let ctx = Arc::new(SyncContext::new(
            virtual_cluster.clone(),
            host_cluster.clone(),
            translator,
            mappings,
            Arc::new(config.clone()),
            "host-ns",
            CancellationToken::new(),
        ));

        let kinds = registry(&config);
        let mut controllers = Vec::new();
        for kind in kinds {
            let gvk = kind.gvk();
            ctx.register_queue(&gvk, Arc::new(WorkQueue::new()));
            controllers.push((gvk, KindController::new(ctx.clone(), kind)));
        }

        Self {
            virtual_cluster,
            host_cluster,
            ctx,
            controllers,
        }
    }

    /// Run one reconcile of the given kind and key
    pub async fn sync(&self, gvk: &GroupVersionKind, key: &ObjKey) -> Result<Outcome, Error> {
        let controller = self
            .controllers
            .iter()
            .find(|(registered, _)| gvk_key(registered) == gvk_key(gvk))
            .map(|(_, controller)| controller)
            .unwrap_or_else(|| panic!("no controller registered for {}", gvk_key(gvk)));
        controller.handle(key).await
    }

    /// The translator used by the harness
    pub fn translator(&self) -> Arc<Translator> {
        self.ctx.translator.clone()
    }
}

/// Build a test object with TypeMeta, metadata and body
pub fn test_object(
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
    body: Value,
) -> DynamicObject {
    let mut obj = DynamicObject {
        types: Some(crate::types::type_meta(gvk)),
        metadata: Default::default(),
        data: body,
    };
    obj.metadata.name = Some(name.to_string());
    obj.metadata.namespace = namespace.map(String::from);
    obj
}

/// Strip volatile and bookkeeping fields before comparison, the
/// sync-test equivalent of ignoring server-assigned state.
pub fn strip_for_compare(obj: &DynamicObject) -> Value {
    let mut obj = obj.clone();
    obj.metadata.uid = None;
    obj.metadata.resource_version = None;
    obj.metadata.creation_timestamp = None;
    obj.metadata.managed_fields = None;
    obj.metadata.generation = None;
    obj.metadata.owner_references = None;

    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        annotations.remove(APPLY_ANNOTATION);
        annotations.remove(LAST_APPLIED_ANNOTATION);
        annotations.remove(LABELS_APPLY_ANNOTATION);
        annotations.remove(OWNER_SET_UID_ANNOTATION);
        if annotations.is_empty() {
            obj.metadata.annotations = None;
        }
    }
    if let Some(labels) = obj.metadata.labels.as_mut() {
        labels.remove(MANAGED_BY_LABEL);
        if labels.is_empty() {
            obj.metadata.labels = None;
        }
    }

    serde_json::to_value(&obj).expect("object serializes")
}

/// Assert a cluster holds exactly the expected objects of a kind,
/// compared after stripping volatile fields.
pub fn assert_cluster_state(
    cluster: &FakeCluster,
    gvk: &GroupVersionKind,
    expected: Vec<DynamicObject>,
) {
    let actual: Vec<Value> = cluster.all(gvk).iter().map(strip_for_compare).collect();
    let wanted: Vec<Value> = expected.iter().map(strip_for_compare).collect();

    if actual != wanted {
        panic!(
            "state mismatch for {}\n\nexpected:\n{}\n\nactual:\n{}",
            gvk_key(gvk),
            serde_json::to_string_pretty(&wanted).unwrap_or_default(),
            serde_json::to_string_pretty(&actual).unwrap_or_default(),
        );
    }
}
