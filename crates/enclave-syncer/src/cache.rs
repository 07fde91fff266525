//! Dual-cluster informer cache layer.
//!
//! One informer per (cluster, kind): a kube watcher stream feeding an
//! indexed in-memory cache and a per-kind work queue. The host-side
//! informer is filtered by the `managed-by` label at the list/watch layer,
//! so foreign host objects never reach the syncer.
//!
//! Watch restarts follow the standard resourceVersion-resume protocol; the
//! kube watcher relists on `Expired` and replays the new state as an init
//! sequence. The cache prunes keys that vanished across the relist and
//! re-enqueues everything it observed, so missed deletions are reconciled
//! without any host-side deletes being issued from the relist itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::TryStreamExt;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{api_resource, ObjKey};

/// Indexed cache of one kind on one cluster.
///
/// Readers are lock-free (sharded maps); the single informer task is the
/// only writer.
#[derive(Default)]
pub struct KindCache {
    objects: DashMap<ObjKey, Arc<DynamicObject>>,
    by_uid: DashMap<String, ObjKey>,
    warm: AtomicBool,
}

impl KindCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the initial list has completed. Reads fall back to the API
    /// until then.
    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// Indexed lookup by object key
    pub fn get(&self, key: &ObjKey) -> Option<Arc<DynamicObject>> {
        self.objects.get(key).map(|entry| entry.clone())
    }

    /// Indexed lookup by UID
    pub fn get_by_uid(&self, uid: &str) -> Option<Arc<DynamicObject>> {
        let key = self.by_uid.get(uid).map(|entry| entry.clone())?;
        self.get(&key)
    }

    /// All keys currently in the cache
    pub fn keys(&self) -> Vec<ObjKey> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    fn upsert(&self, obj: DynamicObject) -> ObjKey {
        let key = ObjKey {
            namespace: obj.metadata.namespace.clone(),
            name: obj.name_any(),
        };
        if let Some(uid) = obj.uid() {
            self.by_uid.insert(uid, key.clone());
        }
        self.objects.insert(key.clone(), Arc::new(obj));
        key
    }

    fn remove(&self, obj: &DynamicObject) -> ObjKey {
        let key = ObjKey {
            namespace: obj.metadata.namespace.clone(),
            name: obj.name_any(),
        };
        self.objects.remove(&key);
        if let Some(uid) = obj.uid() {
            self.by_uid.remove(&uid);
        }
        key
    }

    fn mark_warm(&self) {
        self.warm.store(true, Ordering::Release);
    }
}

/// Where an informer watches: one namespace or the whole cluster, with an
/// optional label selector.
#[derive(Clone, Debug)]
pub struct InformerScope {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

/// Run one informer until cancelled: watch, maintain the cache, and call
/// `enqueue` for every observed object (including relist replays, so the
/// controller re-examines everything after a watch expiry).
pub async fn run_informer(
    client: Client,
    scope: InformerScope,
    cache: Arc<KindCache>,
    enqueue: Arc<dyn Fn(&DynamicObject) + Send + Sync>,
    cancel: CancellationToken,
) {
    let ar = api_resource(&scope.gvk);
    let api: Api<DynamicObject> = match &scope.namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };

    let mut config = watcher::Config::default();
    if let Some(selector) = &scope.label_selector {
        config = config.labels(selector);
    }

    let mut stream = Box::pin(watcher(api, config));
    // keys seen during the current init (relist) window
    let mut relist_seen: Option<HashSet<ObjKey>> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(Event::Init)) => {
                debug!(kind = %scope.gvk.kind, "informer relisting");
                relist_seen = Some(HashSet::new());
            }
            Ok(Some(Event::InitApply(obj))) => {
                let key = cache.upsert(obj.clone());
                if let Some(seen) = relist_seen.as_mut() {
                    seen.insert(key);
                }
                enqueue(&obj);
            }
            Ok(Some(Event::InitDone)) => {
                // prune cache entries that vanished while the watch was
                // down and hand their keys back to the controller
                if let Some(seen) = relist_seen.take() {
                    for key in cache.keys() {
                        if !seen.contains(&key) {
                            if let Some(stale) = cache.get(&key) {
                                let stale = (*stale).clone();
                                cache.remove(&stale);
                                enqueue(&stale);
                            }
                        }
                    }
                }
                cache.mark_warm();
                debug!(kind = %scope.gvk.kind, "informer synced");
            }
            Ok(Some(Event::Apply(obj))) => {
                cache.upsert(obj.clone());
                enqueue(&obj);
            }
            Ok(Some(Event::Delete(obj))) => {
                cache.remove(&obj);
                enqueue(&obj);
            }
            Ok(None) => break,
            Err(e) => {
                // the watcher recovers by itself; surface the gap
                warn!(kind = %scope.gvk.kind, error = %e, "watch error, informer will resync");
            }
        }
    }

    debug!(kind = %scope.gvk.kind, "informer stopped");
}
