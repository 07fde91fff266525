//! Per-kind sync descriptors.
//!
//! Every synchronized kind shares the state machine in
//! [`crate::sync::machine`]; a [`KindSyncer`] contributes only what varies
//! per kind: the direction, the forward and reverse transforms, the fields
//! a host actor may mutate, dependency extraction, and identity overrides.
//! The registry is the dispatch table, keyed by GVK and gated by the sync
//! configuration.

pub mod configmap;
pub mod endpoints;
pub mod node;
pub mod persistentvolume;
pub mod pod;
pub mod secret;
pub mod service;
pub mod serviceaccount;
pub mod storageclass;

use std::sync::Arc;

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use enclave_common::config::SyncerConfig;
use enclave_common::translate::Translator;
use enclave_common::Error;

use crate::client::Propagation;
use crate::types::ObjKey;

/// Which side is authoritative for the spec of a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Virtual spec projects onto the host (workloads)
    Hostward,
    /// Host objects project into the virtual cluster under translated
    /// ownership (nodes, storage classes)
    Virtualward,
    /// Host objects project into the virtual cluster under their own
    /// names (persistent volumes when toHost sync is off)
    Mirror,
}

/// Host-side selection for virtualward kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostFilter {
    /// Project every host object of the kind
    All,
    /// Project only nodes running at least one pod of this virtual cluster
    NodesRunningManagedPods,
}

/// A reference from one virtual object to another that must exist on the
/// host before the referrer is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyRef {
    pub gvk: GroupVersionKind,
    pub key: ObjKey,
}

/// Per-kind contribution to the shared sync state machine.
pub trait KindSyncer: Send + Sync {
    /// The kind this descriptor syncs
    fn gvk(&self) -> GroupVersionKind;

    /// Authoritative direction for this kind
    fn direction(&self) -> Direction;

    /// Whether the kind is cluster-scoped
    fn cluster_scoped(&self) -> bool {
        false
    }

    /// Dotted field paths a host actor may change without the syncer
    /// reverting them
    fn mutation_allowed(&self) -> &'static [&'static str] {
        &[]
    }

    /// Objects of the kind that must never sync (e.g. the apiserver's own
    /// Endpoints, which the hook layer rewrites instead)
    fn excluded(&self, _v: &DynamicObject) -> bool {
        false
    }

    /// The desired host-side document (everything but metadata and status)
    /// computed from the virtual object
    fn desired_host_body(
        &self,
        _v: &DynamicObject,
        _translator: &Translator,
    ) -> Result<Value, Error> {
        Ok(Value::Object(Default::default()))
    }

    /// The patch written back onto the virtual object from the live host
    /// object: status plus any mutation-allowed fields that surfaced
    fn virtual_writeback(&self, _p: &DynamicObject) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    /// The desired virtual-side document for virtualward/mirror kinds
    fn desired_virtual_body(&self, p: &DynamicObject) -> Result<Value, Error> {
        Ok(p.data.clone())
    }

    /// References that must exist on the host before this object is
    /// written
    fn dependencies(&self, _v: &DynamicObject) -> Vec<DependencyRef> {
        Vec::new()
    }

    /// Host name override for kinds with non-deterministic identity. A
    /// `Some` return forces a mapping-store entry.
    fn host_name_override(&self, _v: &DynamicObject) -> Option<String> {
        None
    }

    /// Whether identity bindings for this kind persist in the mapping
    /// store
    fn needs_mapping(&self) -> bool {
        false
    }

    /// Propagation policy for host deletes. Objects that may own
    /// dependents cascade in the foreground so the virtual finalizer is
    /// held until the whole tree is gone; dependents themselves go in the
    /// background.
    fn deletion_propagation(&self, v: &DynamicObject) -> Propagation {
        let has_owner = v
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| !refs.is_empty())
            .unwrap_or(false);
        if has_owner {
            Propagation::Background
        } else {
            Propagation::Foreground
        }
    }

    /// Host-side selection for virtualward kinds
    fn host_filter(&self) -> HostFilter {
        HostFilter::All
    }
}

/// Build the kind registry for the given configuration.
pub fn registry(config: &SyncerConfig) -> Vec<Arc<dyn KindSyncer>> {
    let mut kinds: Vec<Arc<dyn KindSyncer>> = Vec::new();

    if !config.workload_sync_enabled() {
        return kinds;
    }

    let to_host = &config.sync.to_host;
    if to_host.services.enabled {
        kinds.push(Arc::new(service::ServiceSyncer));
    }
    if to_host.config_maps.enabled {
        kinds.push(Arc::new(configmap::ConfigMapSyncer));
    }
    if to_host.secrets.enabled {
        kinds.push(Arc::new(secret::SecretSyncer));
    }
    if to_host.service_accounts.enabled {
        kinds.push(Arc::new(serviceaccount::ServiceAccountSyncer));
    }
    if to_host.pods.enabled {
        kinds.push(Arc::new(pod::PodSyncer {
            sync_service_accounts: to_host.service_accounts.enabled,
        }));
    }
    if to_host.endpoints.enabled {
        kinds.push(Arc::new(endpoints::EndpointsSyncer));
    }

    // PVs follow the original split: synced hostward when enabled, mirrored
    // into the virtual cluster otherwise
    if to_host.persistent_volumes.enabled {
        kinds.push(Arc::new(persistentvolume::PersistentVolumeSyncer));
    } else {
        kinds.push(Arc::new(persistentvolume::PersistentVolumeMirror));
    }

    let from_host = &config.sync.from_host;
    if from_host.nodes.enabled {
        kinds.push(Arc::new(node::NodeSyncer));
    }
    if from_host.storage_classes.enabled {
        kinds.push(Arc::new(storageclass::StorageClassSyncer));
    }

    kinds
}
