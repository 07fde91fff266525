//! The shared per-kind reconciliation state machine.
//!
//! Every synchronized kind runs this machine; the [`KindSyncer`] descriptor
//! contributes only the transforms. One reconcile is one atomic attempt to
//! bring a single key to its desired state and is always idempotent:
//! repeating it with no external change produces no observable mutation.
//!
//! State grid (virtual / host):
//! - absent / absent: nothing to do
//! - present / absent: create the host projection (markers stamped first)
//! - absent / present: adopt-or-delete; our garbage is removed, foreign
//!   objects are never touched
//! - present / present: three-way reconcile, then status write-back
//! - deleting / present: host delete with the kind's propagation policy;
//!   the virtual finalizer is held until the host cache confirms absence
//! - present / deleting: host-initiated deletion mirrors onto the virtual
//!   object

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use enclave_common::constants::{
    APPLY_ANNOTATION, LABELS_APPLY_ANNOTATION, LAST_APPLIED_ANNOTATION, REASON_SYNC_COLLISION,
    REASON_SYNC_CONFLICT, REASON_SYNC_ERROR, SYNCER_FINALIZER,
};
use enclave_common::Error;

use crate::client::{Propagation, SyncEvent};
use crate::context::SyncContext;
use crate::kinds::{Direction, HostFilter, KindSyncer};
use crate::runtime::{KeyHandler, Outcome};
use crate::sync::labels::{sync_bidirectional, user_labels, LabelSyncOutcome, SyncedSets};
use crate::sync::merge::{apply_digest, prune_equal, three_way_merge};
use crate::types::{gvks, type_meta, ObjKey};

/// How soon to look again while waiting for an in-flight host change
const SETTLE_REQUEUE: Duration = Duration::from_secs(1);

/// How soon to look again while a dependency is still being projected
const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(2);

/// One kind's controller: the shared machine bound to a descriptor.
pub struct KindController {
    ctx: Arc<SyncContext>,
    kind: Arc<dyn KindSyncer>,
    kind_name: String,
}

impl KindController {
    pub fn new(ctx: Arc<SyncContext>, kind: Arc<dyn KindSyncer>) -> Self {
        let kind_name = kind.gvk().kind.clone();
        Self {
            ctx,
            kind,
            kind_name,
        }
    }
}

#[async_trait]
impl KeyHandler for KindController {
    fn kind(&self) -> &str {
        &self.kind_name
    }

    #[instrument(skip(self), fields(kind = %self.kind_name, key = %key))]
    async fn handle(&self, key: &ObjKey) -> Result<Outcome, Error> {
        let result = match self.kind.direction() {
            Direction::Hostward => self.sync_hostward(key).await,
            Direction::Virtualward | Direction::Mirror => self.sync_virtualward(key).await,
        };

        match result {
            Err(e) if e.is_forbidden() => {
                // degrade instead of crash-looping; logged once per term
                self.ctx.warn_forbidden_once(&self.kind_name, "write");
                Ok(Outcome::Synced)
            }
            other => other,
        }
    }
}

// =============================================================================
// Hostward direction
// =============================================================================

impl KindController {
    async fn sync_hostward(&self, key: &ObjKey) -> Result<Outcome, Error> {
        let gvk = self.kind.gvk();
        let v_obj = self
            .ctx
            .virtual_cluster
            .get(&gvk, key.namespace.as_deref(), &key.name)
            .await?;

        if let Some(v) = &v_obj {
            if self.kind.excluded(v) {
                return Ok(Outcome::Synced);
            }
        }

        let host_key = self.resolve_host_key(key, v_obj.as_ref());
        let p_obj = self
            .ctx
            .host_cluster
            .get(&gvk, host_key.namespace.as_deref(), &host_key.name)
            .await?;

        match (v_obj, p_obj) {
            (None, None) => Ok(Outcome::Synced),
            (Some(v), p) if v.metadata.deletion_timestamp.is_some() => {
                self.finalize_deletion(&v, p, key, &host_key).await
            }
            (Some(v), None) => self.create_host(&v, key, &host_key).await,
            (Some(v), Some(p)) => self.reconcile_pair(&v, &p, key, &host_key).await,
            (None, Some(p)) => self.cleanup_host(&p, key, &host_key).await,
        }
    }

    /// Host identity for a virtual key: the mapping store for bound
    /// non-deterministic kinds, the per-kind override for first writes,
    /// the translator otherwise.
    fn resolve_host_key(&self, key: &ObjKey, v_obj: Option<&DynamicObject>) -> ObjKey {
        let translator = &self.ctx.translator;
        let gvk = self.kind.gvk();

        if self.kind.cluster_scoped() {
            if self.kind.needs_mapping() {
                if let Some(mapped) = self.ctx.mappings.get_by_virtual(&gvk, key) {
                    return mapped;
                }
            }
            if let Some(v) = v_obj {
                if let Some(name) = self.kind.host_name_override(v) {
                    return ObjKey::cluster(name);
                }
            }
            ObjKey::cluster(translator.host_name_cluster(&key.name))
        } else {
            let namespace = key.namespace.as_deref().unwrap_or_default();
            ObjKey::namespaced(
                translator.host_namespace(namespace),
                translator.host_name(&key.name, namespace),
            )
        }
    }

    async fn create_host(
        &self,
        v: &DynamicObject,
        key: &ObjKey,
        host_key: &ObjKey,
    ) -> Result<Outcome, Error> {
        let gvk = self.kind.gvk();

        let missing = self.missing_dependencies(v).await?;
        if !missing.is_empty() {
            debug!(missing = ?missing, "waiting for dependencies");
            return Ok(Outcome::RequeueAfter(DEPENDENCY_REQUEUE));
        }

        let body = self.kind.desired_host_body(v, &self.ctx.translator)?;
        let owner_uid = v.uid().unwrap_or_default();

        let mut p = DynamicObject {
            types: Some(type_meta(&gvk)),
            metadata: Default::default(),
            data: body.clone(),
        };
        p.metadata.name = Some(host_key.name.clone());
        p.metadata.namespace = host_key.namespace.clone();
        self.ctx.translator.apply_markers(&mut p, &owner_uid);

        // user labels/annotations seed the bidirectional sync state
        let synced = SyncedSets {
            labels: user_labels(v.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())),
            annotations: user_labels(v.metadata.annotations.as_ref().unwrap_or(&BTreeMap::new())),
        };
        p.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(synced.labels.clone());
        let annotations = p.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.extend(synced.annotations.clone());
        annotations.insert(APPLY_ANNOTATION.to_string(), apply_digest(&body));
        annotations.insert(
            LAST_APPLIED_ANNOTATION.to_string(),
            serde_json::to_string(&body)
                .map_err(|e| Error::serialization(format!("last-applied: {}", e)))?,
        );
        annotations.insert(LABELS_APPLY_ANNOTATION.to_string(), synced.encode());

        // the binding must be durable before the first host write so a
        // crash in between is recoverable from either side
        if self.kind.needs_mapping() {
            self.ctx.mappings.put(&gvk, key, host_key)?;
        }

        match self.ctx.host_cluster.create(&gvk, &p).await {
            Ok(created) => {
                info!(host = %host_key, "host projection created");
                self.ensure_finalizer(v, key).await?;
                self.write_back(v, key, &created, LabelSyncOutcome::default()).await?;
                Ok(Outcome::Synced)
            }
            Err(e) if e.is_already_exists() => {
                // cache lag: fetch and decide adoption vs collision
                let existing = self
                    .ctx
                    .host_cluster
                    .get(&gvk, host_key.namespace.as_deref(), &host_key.name)
                    .await?;
                match existing {
                    Some(p) if self.ctx.translator.is_managed(&p) => {
                        self.reconcile_pair(v, &p, key, host_key).await
                    }
                    Some(_) => self.report_collision(v, host_key).await,
                    None => Ok(Outcome::RequeueAfter(SETTLE_REQUEUE)),
                }
            }
            Err(e) if e.is_invalid() => self.report_rejection(v, e).await,
            Err(e) => Err(e),
        }
    }

    async fn reconcile_pair(
        &self,
        v: &DynamicObject,
        p: &DynamicObject,
        key: &ObjKey,
        host_key: &ObjKey,
    ) -> Result<Outcome, Error> {
        let gvk = self.kind.gvk();
        let translator = &self.ctx.translator;

        if !translator.is_managed(p) {
            return self.report_collision(v, host_key).await;
        }

        // bind (or re-bind after restart) before anything destructive: the
        // store rejects a host identity already claimed by another virtual
        // object, which must halt the kind rather than overwrite
        if self.kind.needs_mapping() {
            self.ctx.mappings.put(&gvk, key, host_key)?;
        }

        if p.metadata.deletion_timestamp.is_some() {
            // host-initiated deletion mirrors onto the virtual object
            info!(host = %host_key, "host object deleting, mirroring to virtual");
            self.ctx
                .virtual_cluster
                .delete(&gvk, key.namespace.as_deref(), &key.name, Propagation::Background)
                .await?;
            return Ok(Outcome::RequeueAfter(SETTLE_REQUEUE));
        }

        // a marker with a different owner UID is a leftover from a deleted
        // virtual object that shared the name; it is our garbage
        let owner_uid = v.uid().unwrap_or_default();
        if translator.owner_uid(p) != Some(owner_uid.as_str()) {
            info!(host = %host_key, "host object owned by a previous incarnation, replacing");
            self.ctx
                .host_cluster
                .delete(&gvk, host_key.namespace.as_deref(), &host_key.name, Propagation::Background)
                .await?;
            return Ok(Outcome::RequeueAfter(SETTLE_REQUEUE));
        }

        self.ensure_finalizer(v, key).await?;

        // three-way merge of the host document
        let desired = self.kind.desired_host_body(v, translator)?;
        let last_applied = annotation(p, LAST_APPLIED_ANNOTATION)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| json!({}));
        let mut live = p.data.clone();
        if let Some(map) = live.as_object_mut() {
            map.remove("status");
        }

        let merge = three_way_merge(&last_applied, &desired, &live, self.kind.mutation_allowed());

        // bidirectional label/annotation sync
        let empty = BTreeMap::new();
        let last_sets = SyncedSets::parse(annotation(p, LABELS_APPLY_ANNOTATION).as_deref());
        let label_sync = sync_bidirectional(
            &user_labels(v.metadata.labels.as_ref().unwrap_or(&empty)),
            &user_labels(p.metadata.labels.as_ref().unwrap_or(&empty)),
            &last_sets.labels,
        );
        let annotation_sync = sync_bidirectional(
            &user_labels(v.metadata.annotations.as_ref().unwrap_or(&empty)),
            &user_labels(p.metadata.annotations.as_ref().unwrap_or(&empty)),
            &last_sets.annotations,
        );

        let new_digest = apply_digest(&desired);
        let digest_changed = annotation(p, APPLY_ANNOTATION).as_deref() != Some(new_digest.as_str());
        // bookkeeping must advance even when only the virtual side is
        // written, or a later deletion cannot tell which side removed a key
        let synced_sets_changed =
            label_sync.applied != last_sets.labels || annotation_sync.applied != last_sets.annotations;

        if merge.patch.is_some()
            || digest_changed
            || synced_sets_changed
            || !label_sync.host_patch.is_empty()
            || !annotation_sync.host_patch.is_empty()
        {
            let mut patch = merge.patch.clone().unwrap_or_else(|| json!({}));

            let mut meta_annotations = map_patch(&annotation_sync.host_patch);
            meta_annotations.insert(APPLY_ANNOTATION.to_string(), Value::String(new_digest));
            meta_annotations.insert(
                LAST_APPLIED_ANNOTATION.to_string(),
                Value::String(
                    serde_json::to_string(&desired)
                        .map_err(|e| Error::serialization(format!("last-applied: {}", e)))?,
                ),
            );
            meta_annotations.insert(
                LABELS_APPLY_ANNOTATION.to_string(),
                Value::String(
                    SyncedSets {
                        labels: label_sync.applied.clone(),
                        annotations: annotation_sync.applied.clone(),
                    }
                    .encode(),
                ),
            );

            patch["metadata"] = json!({
                "labels": map_patch(&label_sync.host_patch),
                "annotations": meta_annotations,
                // write conflicts always requeue; the next attempt reads
                // fresh cached state
                "resourceVersion": p.metadata.resource_version,
            });

            debug!(host = %host_key, "patching host object");
            let result = self
                .ctx
                .host_cluster
                .patch_merge(&gvk, host_key.namespace.as_deref(), &host_key.name, &patch)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.is_invalid() => return self.report_rejection(v, e).await,
                Err(e) => return Err(e),
            }
        }

        if !merge.conflicts.is_empty() {
            warn!(conflicts = ?merge.conflicts, "both sides changed, virtual spec wins");
            self.ctx
                .virtual_cluster
                .record_event(
                    v,
                    &SyncEvent::warning(
                        REASON_SYNC_CONFLICT,
                        format!(
                            "host-side changes overwritten on: {}",
                            merge.conflicts.join(", ")
                        ),
                    ),
                )
                .await
                .ok();
        }

        self.write_back_with_meta(v, key, p, &label_sync, &annotation_sync).await?;
        Ok(Outcome::Synced)
    }

    async fn cleanup_host(
        &self,
        p: &DynamicObject,
        key: &ObjKey,
        host_key: &ObjKey,
    ) -> Result<Outcome, Error> {
        let gvk = self.kind.gvk();

        // a host object missing our markers is never claimed
        if !self.ctx.translator.is_managed(p) {
            return Ok(Outcome::Synced);
        }

        if p.metadata.deletion_timestamp.is_none() {
            info!(host = %host_key, "removing orphaned host projection");
            self.ctx
                .host_cluster
                .delete(&gvk, host_key.namespace.as_deref(), &host_key.name, Propagation::Background)
                .await?;
        }
        if self.kind.needs_mapping() {
            self.ctx.mappings.remove(&gvk, key);
        }
        Ok(Outcome::Synced)
    }

    async fn finalize_deletion(
        &self,
        v: &DynamicObject,
        p: Option<DynamicObject>,
        key: &ObjKey,
        host_key: &ObjKey,
    ) -> Result<Outcome, Error> {
        let gvk = self.kind.gvk();

        match p {
            Some(p) if self.ctx.translator.is_managed(&p) => {
                if p.metadata.deletion_timestamp.is_none() {
                    let propagation = self.kind.deletion_propagation(v);
                    info!(host = %host_key, ?propagation, "deleting host projection");
                    self.ctx
                        .host_cluster
                        .delete(&gvk, host_key.namespace.as_deref(), &host_key.name, propagation)
                        .await?;
                }
                // hold the finalizer until the host cache confirms absence
                Ok(Outcome::RequeueAfter(SETTLE_REQUEUE))
            }
            _ => {
                self.remove_finalizer(v, key).await?;
                if self.kind.needs_mapping() {
                    self.ctx.mappings.remove(&gvk, key);
                }
                Ok(Outcome::Synced)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shared pieces
    // -------------------------------------------------------------------------

    async fn missing_dependencies(&self, v: &DynamicObject) -> Result<Vec<String>, Error> {
        let mut missing = Vec::new();

        for dep in self.kind.dependencies(v) {
            // kinds without a controller are not synced; nothing to wait for
            if !self.ctx.kind_synced(&dep.gvk) {
                continue;
            }

            let namespace = dep.key.namespace.as_deref().unwrap_or_default();
            let host_key = ObjKey::namespaced(
                self.ctx.translator.host_namespace(namespace),
                self.ctx.translator.host_name(&dep.key.name, namespace),
            );
            let present = self
                .ctx
                .host_cluster
                .get(&dep.gvk, host_key.namespace.as_deref(), &host_key.name)
                .await?
                .is_some();
            if !present {
                // reconcile the referenced object first
                self.ctx.enqueue(&dep.gvk, dep.key.clone());
                missing.push(format!("{}/{}", dep.gvk.kind, dep.key));
            }
        }

        Ok(missing)
    }

    async fn ensure_finalizer(&self, v: &DynamicObject, key: &ObjKey) -> Result<(), Error> {
        let finalizers = v.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == SYNCER_FINALIZER) {
            return Ok(());
        }
        let mut updated = finalizers;
        updated.push(SYNCER_FINALIZER.to_string());
        let patch = json!({
            "metadata": {
                "finalizers": updated,
                "resourceVersion": v.metadata.resource_version,
            }
        });
        self.ctx
            .virtual_cluster
            .patch_merge(&self.kind.gvk(), key.namespace.as_deref(), &key.name, &patch)
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, v: &DynamicObject, key: &ObjKey) -> Result<(), Error> {
        let finalizers = v.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == SYNCER_FINALIZER) {
            return Ok(());
        }
        let remaining: Vec<String> = finalizers
            .into_iter()
            .filter(|f| f != SYNCER_FINALIZER)
            .collect();
        let patch = json!({
            "metadata": {
                "finalizers": remaining,
                "resourceVersion": v.metadata.resource_version,
            }
        });
        self.ctx
            .virtual_cluster
            .patch_merge(&self.kind.gvk(), key.namespace.as_deref(), &key.name, &patch)
            .await?;
        Ok(())
    }

    async fn report_collision(
        &self,
        v: &DynamicObject,
        host_key: &ObjKey,
    ) -> Result<Outcome, Error> {
        let message = format!(
            "host object {} exists and is not managed by this virtual cluster",
            host_key
        );
        self.ctx
            .virtual_cluster
            .record_event(v, &SyncEvent::warning(REASON_SYNC_COLLISION, message.clone()))
            .await
            .ok();
        Err(Error::collision(&self.kind_name, host_key.to_string(), message))
    }

    async fn report_rejection(&self, v: &DynamicObject, err: Error) -> Result<Outcome, Error> {
        let message = err.to_string();
        self.ctx
            .virtual_cluster
            .record_event(v, &SyncEvent::warning(REASON_SYNC_ERROR, message.clone()))
            .await
            .ok();
        Err(Error::HostValidation {
            kind: self.kind_name.clone(),
            key: v.name_any(),
            message,
        })
    }

    /// Write status and surfaced host fields back onto the virtual object.
    async fn write_back(
        &self,
        v: &DynamicObject,
        key: &ObjKey,
        p: &DynamicObject,
        label_sync: LabelSyncOutcome,
    ) -> Result<(), Error> {
        let annotation_sync = LabelSyncOutcome::default();
        self.write_back_with_meta(v, key, p, &label_sync, &annotation_sync).await
    }

    async fn write_back_with_meta(
        &self,
        v: &DynamicObject,
        key: &ObjKey,
        p: &DynamicObject,
        label_sync: &LabelSyncOutcome,
        annotation_sync: &LabelSyncOutcome,
    ) -> Result<(), Error> {
        let mut patch = match self.kind.virtual_writeback(p)? {
            Value::Null => json!({}),
            other => other,
        };

        if !label_sync.virtual_patch.is_empty() || !annotation_sync.virtual_patch.is_empty() {
            patch["metadata"] = json!({
                "labels": map_patch(&label_sync.virtual_patch),
                "annotations": map_patch(&annotation_sync.virtual_patch),
            });
        }

        let current = serde_json::to_value(v)
            .map_err(|e| Error::serialization(format!("virtual object: {}", e)))?;
        let Some(mut pruned) = prune_equal(patch, &current) else {
            return Ok(());
        };

        if let Some(rv) = &v.metadata.resource_version {
            pruned["metadata"]["resourceVersion"] = Value::String(rv.clone());
        }

        debug!(key = %key, "writing back to virtual object");
        self.ctx
            .virtual_cluster
            .patch_merge(&self.kind.gvk(), key.namespace.as_deref(), &key.name, &pruned)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Virtualward / mirror direction
// =============================================================================

impl KindController {
    async fn sync_virtualward(&self, key: &ObjKey) -> Result<Outcome, Error> {
        let gvk = self.kind.gvk();
        let translator = &self.ctx.translator;

        let p_obj = self.ctx.host_cluster.get(&gvk, None, &key.name).await?;
        let v_obj = self.ctx.virtual_cluster.get(&gvk, None, &key.name).await?;

        let projected = match &p_obj {
            Some(p) => self.should_project(p).await?,
            None => false,
        };

        match (projected, p_obj, v_obj) {
            (false, _, None) => Ok(Outcome::Synced),
            (false, _, Some(v)) => {
                // host object gone or filtered out: withdraw our projection
                if translator.is_managed(&v) {
                    debug!(key = %key, "withdrawing virtual projection");
                    self.ctx
                        .virtual_cluster
                        .delete(&gvk, None, &key.name, Propagation::Background)
                        .await?;
                }
                Ok(Outcome::Synced)
            }
            (true, Some(p), None) => {
                let body = self.kind.desired_virtual_body(&p)?;
                let mut v = DynamicObject {
                    types: Some(type_meta(&gvk)),
                    metadata: Default::default(),
                    data: body.clone(),
                };
                v.metadata.name = Some(key.name.clone());
                translator.apply_markers(&mut v, &p.uid().unwrap_or_default());
                if let Some(labels) = p.metadata.labels.as_ref() {
                    v.metadata
                        .labels
                        .get_or_insert_with(BTreeMap::new)
                        .extend(user_labels(labels));
                }
                v.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(
                    LAST_APPLIED_ANNOTATION.to_string(),
                    serde_json::to_string(&body)
                        .map_err(|e| Error::serialization(format!("last-applied: {}", e)))?,
                );

                match self.ctx.virtual_cluster.create(&gvk, &v).await {
                    Ok(_) => {
                        info!(key = %key, "projected host object into virtual cluster");
                        Ok(Outcome::Synced)
                    }
                    Err(e) if e.is_already_exists() => Ok(Outcome::RequeueAfter(SETTLE_REQUEUE)),
                    Err(e) => Err(e),
                }
            }
            (true, Some(p), Some(v)) => {
                // host authoritative: virtual-side edits to managed fields
                // revert on the next pass
                let desired = self.kind.desired_virtual_body(&p)?;
                let last_applied = annotation(&v, LAST_APPLIED_ANNOTATION)
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_else(|| json!({}));
                let merge =
                    three_way_merge(&last_applied, &desired, &v.data, self.kind.mutation_allowed());

                if let Some(mut patch) = merge.patch {
                    patch["metadata"] = json!({
                        "annotations": {
                            LAST_APPLIED_ANNOTATION: serde_json::to_string(&desired)
                                .map_err(|e| Error::serialization(format!("last-applied: {}", e)))?,
                        },
                        "resourceVersion": v.metadata.resource_version,
                    });
                    self.ctx
                        .virtual_cluster
                        .patch_merge(&gvk, None, &key.name, &patch)
                        .await?;
                }
                Ok(Outcome::Synced)
            }
            (true, None, _) => Ok(Outcome::Synced),
        }
    }

    async fn should_project(&self, p: &DynamicObject) -> Result<bool, Error> {
        match self.kind.host_filter() {
            HostFilter::All => Ok(true),
            HostFilter::NodesRunningManagedPods => {
                let selector = self.ctx.translator.managed_by_selector();
                let pods = self
                    .ctx
                    .host_cluster
                    .list(&gvks::pod(), Some(&self.ctx.target_namespace), Some(&selector))
                    .await?;
                let node_name = p.name_any();
                Ok(pods.iter().any(|pod| {
                    pod.data
                        .pointer("/spec/nodeName")
                        .and_then(Value::as_str)
                        .map(|scheduled| scheduled == node_name)
                        .unwrap_or(false)
                }))
            }
        }
    }
}

// =============================================================================
// Small helpers
// =============================================================================

fn annotation(obj: &DynamicObject, key: &str) -> Option<String> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .cloned()
}

/// A `BTreeMap<String, Option<String>>` as a JSON merge-patch fragment
/// (`None` → null → delete).
fn map_patch(changes: &BTreeMap<String, Option<String>>) -> serde_json::Map<String, Value> {
    changes
        .iter()
        .map(|(key, value)| {
            (
                key.clone(),
                value
                    .as_ref()
                    .map(|v| Value::String(v.clone()))
                    .unwrap_or(Value::Null),
            )
        })
        .collect()
}
