//! Durable store for non-deterministic identity bindings.
//!
//! Most kinds translate names deterministically and never touch this
//! store. The exceptions (PersistentVolumes bound to a user-chosen host PV
//! name) persist a binding here before the first host write; the entry is
//! then the source of truth for every later lookup.
//!
//! The backing ConfigMap is written by a single task (leadership guarantees
//! a single writer) with a one-second coalescing window; each write
//! serializes the full index under an optimistic resourceVersion check. A
//! failed snapshot write never blocks a host write that already succeeded:
//! the binding stays in memory, dirty, and the next reconcile re-puts it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::api::GroupVersionKind;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use enclave_common::constants::{MAPPINGS_CONFIGMAP, MAPPINGS_CONFIGMAP_KEY};
use enclave_common::retry::{retry_with_backoff, RetryConfig};
use enclave_common::Error;

use crate::client::ClusterClient;
use crate::types::{gvk_key, gvks, ObjKey};

/// How long puts are coalesced before a snapshot write
const COALESCE_WINDOW: Duration = Duration::from_secs(1);

/// Conflict retries per snapshot attempt; exhaustion leaves the index
/// dirty for the next window
const SNAPSHOT_ATTEMPTS: u32 = 3;

/// Bidirectional index of virtual ↔ host identity bindings.
pub struct MappingStore {
    /// `<gvk>/<vNamespace>/<vName>` → `<pNamespace>/<pName>`
    by_virtual: DashMap<String, String>,
    /// `<gvk>/<pNamespace>/<pName>` → `<vNamespace>/<vName>`
    by_host: DashMap<String, String>,
    dirty: AtomicBool,
    changed: Notify,
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingStore {
    pub fn new() -> Self {
        Self {
            by_virtual: DashMap::new(),
            by_host: DashMap::new(),
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    fn virtual_index_key(gvk: &GroupVersionKind, v_key: &ObjKey) -> String {
        format!("{}/{}", gvk_key(gvk), v_key.encode())
    }

    fn host_index_key(gvk: &GroupVersionKind, p_key: &ObjKey) -> String {
        format!("{}/{}", gvk_key(gvk), p_key.encode())
    }

    /// Record a binding. Rejects a host identity already claimed by a
    /// different virtual object of the same kind: that violation would
    /// cause data loss, so it is fatal for the kind.
    pub fn put(
        &self,
        gvk: &GroupVersionKind,
        v_key: &ObjKey,
        p_key: &ObjKey,
    ) -> Result<(), Error> {
        let vk = Self::virtual_index_key(gvk, v_key);
        let hk = Self::host_index_key(gvk, p_key);

        if let Some(existing) = self.by_host.get(&hk) {
            if *existing != v_key.encode() {
                return Err(Error::MappingConflict {
                    kind: gvk.kind.clone(),
                    message: format!(
                        "host identity {} is already bound to virtual {} (attempted {})",
                        p_key, *existing, v_key
                    ),
                });
            }
        }

        let prev = self.by_virtual.insert(vk, p_key.encode());
        self.by_host.insert(hk, v_key.encode());

        if prev.as_deref() != Some(&p_key.encode()) {
            self.mark_dirty();
        }
        Ok(())
    }

    /// Host identity bound to a virtual object, if any
    pub fn get_by_virtual(&self, gvk: &GroupVersionKind, v_key: &ObjKey) -> Option<ObjKey> {
        self.by_virtual
            .get(&Self::virtual_index_key(gvk, v_key))
            .and_then(|encoded| ObjKey::decode(&encoded))
    }

    /// Virtual identity bound to a host object, if any
    pub fn get_by_host(&self, gvk: &GroupVersionKind, p_key: &ObjKey) -> Option<ObjKey> {
        self.by_host
            .get(&Self::host_index_key(gvk, p_key))
            .and_then(|encoded| ObjKey::decode(&encoded))
    }

    /// Drop the binding for a virtual object (after its host projection is
    /// confirmed gone)
    pub fn remove(&self, gvk: &GroupVersionKind, v_key: &ObjKey) {
        if let Some((_, p_encoded)) = self.by_virtual.remove(&Self::virtual_index_key(gvk, v_key)) {
            if let Some(p_key) = ObjKey::decode(&p_encoded) {
                self.by_host.remove(&Self::host_index_key(gvk, &p_key));
            }
            self.mark_dirty();
        }
    }

    /// Number of bindings held
    pub fn len(&self) -> usize {
        self.by_virtual.len()
    }

    /// Whether the store holds no bindings
    pub fn is_empty(&self) -> bool {
        self.by_virtual.is_empty()
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    /// Serialize the full index in the snapshot wire format
    fn snapshot(&self) -> String {
        let index: BTreeMap<String, String> = self
            .by_virtual
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        serde_json::to_string(&index).unwrap_or_else(|_| "{}".to_string())
    }

    /// Rebuild the in-memory index from a snapshot payload
    fn load_snapshot(&self, payload: &str) -> Result<usize, Error> {
        let index: BTreeMap<String, String> = serde_json::from_str(payload)
            .map_err(|e| Error::mapping_store(format!("corrupt snapshot: {}", e)))?;

        for (virtual_key, host_encoded) in &index {
            // virtual_key = <gvk...>/<vNamespace>/<vName>; the gvk part may
            // itself contain slashes, so split from the right
            let mut parts = virtual_key.rsplitn(3, '/');
            let name = parts.next().unwrap_or_default();
            let namespace = parts.next().unwrap_or_default();
            let gvk_part = parts.next().unwrap_or_default();
            if name.is_empty() || gvk_part.is_empty() {
                warn!(key = %virtual_key, "skipping malformed mapping entry");
                continue;
            }
            self.by_virtual.insert(virtual_key.clone(), host_encoded.clone());
            self.by_host.insert(
                format!("{}/{}", gvk_part, host_encoded),
                format!("{}/{}", namespace, name),
            );
        }
        Ok(index.len())
    }

    /// Load the snapshot from the backing ConfigMap on startup. A missing
    /// ConfigMap is an empty store, not an error.
    pub async fn load(
        &self,
        host: &dyn ClusterClient,
        namespace: &str,
    ) -> Result<(), Error> {
        let existing = host
            .get(&gvks::config_map(), Some(namespace), MAPPINGS_CONFIGMAP)
            .await?;

        let Some(config_map) = existing else {
            info!("no mapping snapshot found, starting empty");
            return Ok(());
        };

        let payload = config_map
            .data
            .get("data")
            .and_then(|data| data.get(MAPPINGS_CONFIGMAP_KEY))
            .and_then(|v| v.as_str())
            .unwrap_or("{}");

        let loaded = self.load_snapshot(payload)?;
        info!(mappings = loaded, "mapping snapshot loaded");
        Ok(())
    }

    /// Persist snapshots until cancelled: wait for a change, coalesce for
    /// one second, then write the full index under a resourceVersion check.
    pub async fn run_persistence(
        self: Arc<Self>,
        host: Arc<dyn ClusterClient>,
        namespace: String,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.changed.notified() => {}
            }

            // coalescing window: absorb the burst before serializing
            tokio::time::sleep(COALESCE_WINDOW).await;

            if !self.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }

            if let Err(e) = self.write_snapshot(host.as_ref(), &namespace).await {
                // never blocks reconciles; the index stays dirty and the
                // next put retriggers the write
                warn!(error = %e, "mapping snapshot write failed, keeping in memory");
                self.dirty.store(true, Ordering::Release);
            }
        }

        // final flush so a clean shutdown loses nothing
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.write_snapshot(host.as_ref(), &namespace).await {
                warn!(error = %e, "final mapping snapshot write failed");
            }
        }
    }

    /// Force an immediate snapshot write (shutdown, tests).
    pub async fn flush(
        &self,
        host: &dyn ClusterClient,
        namespace: &str,
    ) -> Result<(), Error> {
        self.dirty.store(false, Ordering::Release);
        self.write_snapshot(host, namespace).await
    }

    /// One snapshot write: create the ConfigMap if absent, otherwise patch
    /// it under the observed resourceVersion, retrying conflicts.
    async fn write_snapshot(
        &self,
        host: &dyn ClusterClient,
        namespace: &str,
    ) -> Result<(), Error> {
        let config = RetryConfig {
            max_attempts: SNAPSHOT_ATTEMPTS,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };

        retry_with_backoff(&config, "mapping_snapshot", || async {
            let payload = self.snapshot();
            let gvk = gvks::config_map();
            let existing = host.get(&gvk, Some(namespace), MAPPINGS_CONFIGMAP).await?;

            match existing {
                None => {
                    let mut obj = kube::api::DynamicObject {
                        types: Some(kube::api::TypeMeta {
                            api_version: "v1".to_string(),
                            kind: "ConfigMap".to_string(),
                        }),
                        metadata: Default::default(),
                        data: json!({"data": {MAPPINGS_CONFIGMAP_KEY: payload}}),
                    };
                    obj.metadata.name = Some(MAPPINGS_CONFIGMAP.to_string());
                    obj.metadata.namespace = Some(namespace.to_string());
                    host.create(&gvk, &obj).await?;
                }
                Some(current) => {
                    let patch = json!({
                        "metadata": {
                            "resourceVersion": current.metadata.resource_version,
                        },
                        "data": {MAPPINGS_CONFIGMAP_KEY: payload},
                    });
                    host.patch_merge(&gvk, Some(namespace), MAPPINGS_CONFIGMAP, &patch)
                        .await?;
                }
            }

            debug!(mappings = self.len(), "mapping snapshot written");
            Ok::<(), Error>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv_gvk() -> GroupVersionKind {
        gvks::persistent_volume()
    }

    #[test]
    fn put_and_lookup_both_directions() {
        let store = MappingStore::new();
        let v = ObjKey::cluster("data-vol");
        let p = ObjKey::cluster("pv-host-0001");

        store.put(&pv_gvk(), &v, &p).unwrap();
        assert_eq!(store.get_by_virtual(&pv_gvk(), &v), Some(p.clone()));
        assert_eq!(store.get_by_host(&pv_gvk(), &p), Some(v.clone()));

        store.remove(&pv_gvk(), &v);
        assert_eq!(store.get_by_virtual(&pv_gvk(), &v), None);
        assert_eq!(store.get_by_host(&pv_gvk(), &p), None);
    }

    #[test]
    fn double_claim_of_host_identity_is_fatal() {
        let store = MappingStore::new();
        let p = ObjKey::cluster("pv-host-0001");

        store.put(&pv_gvk(), &ObjKey::cluster("vol-a"), &p).unwrap();
        let err = store
            .put(&pv_gvk(), &ObjKey::cluster("vol-b"), &p)
            .unwrap_err();
        assert!(err.is_fatal());

        // re-putting the same binding is idempotent
        store.put(&pv_gvk(), &ObjKey::cluster("vol-a"), &p).unwrap();
    }

    #[test]
    fn snapshot_round_trip() {
        let store = MappingStore::new();
        store
            .put(&pv_gvk(), &ObjKey::cluster("data-vol"), &ObjKey::cluster("pv-host-0001"))
            .unwrap();
        store
            .put(
                &pv_gvk(),
                &ObjKey::cluster("logs-vol"),
                &ObjKey::cluster("pv-host-0002"),
            )
            .unwrap();

        let payload = store.snapshot();
        assert!(payload.contains("v1/PersistentVolume//data-vol"));

        let restored = MappingStore::new();
        restored.load_snapshot(&payload).unwrap();
        assert_eq!(
            restored.get_by_virtual(&pv_gvk(), &ObjKey::cluster("data-vol")),
            Some(ObjKey::cluster("pv-host-0001"))
        );
        assert_eq!(
            restored.get_by_host(&pv_gvk(), &ObjKey::cluster("pv-host-0002")),
            Some(ObjKey::cluster("logs-vol"))
        );
    }

    #[test]
    fn malformed_snapshot_entries_are_skipped() {
        let store = MappingStore::new();
        let payload = r#"{"garbage": "x/y", "v1/PersistentVolume//ok": "/pv-1"}"#;
        store.load_snapshot(payload).unwrap();
        assert_eq!(
            store.get_by_virtual(&pv_gvk(), &ObjKey::cluster("ok")),
            Some(ObjKey::cluster("pv-1"))
        );
        assert_eq!(store.len(), 1);
    }
}
