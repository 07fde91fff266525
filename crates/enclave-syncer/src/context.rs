//! The sync context threaded through every reconcile.
//!
//! Carries the two cluster clients, the translator, the mapping store and
//! the cancellation signal as one explicit parameter. There is no
//! process-global state; tests construct a context around fakes.

use std::sync::Arc;

use dashmap::DashMap;
use kube::api::GroupVersionKind;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use enclave_common::config::SyncerConfig;
use enclave_common::translate::Translator;

use crate::client::ClusterClient;
use crate::mappings::MappingStore;
use crate::runtime::queue::WorkQueue;
use crate::types::{gvk_key, ObjKey};

/// Shared state for all per-kind controllers.
pub struct SyncContext {
    /// Client for the virtual control plane
    pub virtual_cluster: Arc<dyn ClusterClient>,
    /// Client for the host cluster
    pub host_cluster: Arc<dyn ClusterClient>,
    /// Identity translation
    pub translator: Arc<Translator>,
    /// Non-deterministic identity bindings
    pub mappings: Arc<MappingStore>,
    /// Sync configuration
    pub config: Arc<SyncerConfig>,
    /// The shared host namespace (mapping snapshot, leases)
    pub target_namespace: String,
    /// Cancellation for the whole syncer
    pub cancel: CancellationToken,
    /// Per-kind work queues for cross-kind dependency enqueueing
    queues: DashMap<String, Arc<WorkQueue>>,
    /// (kind, verb) pairs already warned about permission denials this
    /// leader term
    forbidden_warned: DashMap<String, ()>,
}

impl SyncContext {
    pub fn new(
        virtual_cluster: Arc<dyn ClusterClient>,
        host_cluster: Arc<dyn ClusterClient>,
        translator: Arc<Translator>,
        mappings: Arc<MappingStore>,
        config: Arc<SyncerConfig>,
        target_namespace: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            virtual_cluster,
            host_cluster,
            translator,
            mappings,
            config,
            target_namespace: target_namespace.into(),
            cancel,
            queues: DashMap::new(),
            forbidden_warned: DashMap::new(),
        }
    }

    /// Register a kind's work queue; marks the kind as synced for
    /// dependency resolution.
    pub fn register_queue(&self, gvk: &GroupVersionKind, queue: Arc<WorkQueue>) {
        self.queues.insert(gvk_key(gvk), queue);
    }

    /// Whether a kind participates in sync (has a registered controller)
    pub fn kind_synced(&self, gvk: &GroupVersionKind) -> bool {
        self.queues.contains_key(&gvk_key(gvk))
    }

    /// Enqueue a key on another kind's queue (dependency resolution).
    /// A no-op for kinds without a controller.
    pub fn enqueue(&self, gvk: &GroupVersionKind, key: ObjKey) {
        if let Some(queue) = self.queues.get(&gvk_key(gvk)) {
            queue.enqueue(key);
        }
    }

    /// Log a permission denial once per (kind, verb) per leader term.
    /// Returns whether this was the first occurrence.
    pub fn warn_forbidden_once(&self, kind: &str, verb: &str) -> bool {
        let key = format!("{}/{}", kind, verb);
        let first = self.forbidden_warned.insert(key, ()).is_none();
        if first {
            warn!(
                kind = %kind,
                verb = %verb,
                "permission denied, degrading sync for this kind"
            );
        }
        first
    }
}
