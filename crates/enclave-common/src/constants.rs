//! Marker conventions written onto every host object the syncer owns.
//!
//! These keys are a stable wire format: other tooling selects, audits and
//! garbage-collects enclave-managed objects by them. Changing any value here
//! orphans every object written by previous syncer versions.

/// Label carrying the owning virtual cluster's name. Doubles as the
/// list/watch selector on the host informer, so the syncer never observes
/// foreign objects.
pub const MANAGED_BY_LABEL: &str = "vcluster.loft.sh/managed-by";

/// Annotation holding the UID of the virtual object a host object was
/// projected from. Primary reverse-lookup path; survives name mangling.
pub const OWNER_SET_UID_ANNOTATION: &str = "vcluster.loft.sh/owner-set-uid";

/// Annotation holding the SHA-256 digest of the canonical JSON of the last
/// applied host spec. Enables three-way merge without server-side apply.
pub const APPLY_ANNOTATION: &str = "vcluster.loft.sh/apply";

/// Annotation holding the canonical JSON of the last applied host spec.
/// The `apply` digest detects change cheaply; this document feeds the
/// three-way diff.
pub const LAST_APPLIED_ANNOTATION: &str = "vcluster.loft.sh/last-applied";

/// Annotation holding the last synced user label/annotation sets, used to
/// decide the winning side during bidirectional sync.
pub const LABELS_APPLY_ANNOTATION: &str = "vcluster.loft.sh/labels-apply";

/// Annotation a user may place on a virtual PersistentVolume to bind it to
/// an existing host PV by name instead of a translated name.
pub const HOST_PV_ANNOTATION: &str = "vcluster.loft.sh/host-pv";

/// Annotation prefix under which all enclave bookkeeping lives. Keys with
/// this prefix are never part of bidirectional label/annotation sync.
pub const MARKER_PREFIX: &str = "vcluster.loft.sh/";

/// Finalizer held on virtual objects while their host projection exists.
pub const SYNCER_FINALIZER: &str = "vcluster.loft.sh/syncer";

/// Name of the ConfigMap backing the mapping store snapshot.
pub const MAPPINGS_CONFIGMAP: &str = "vc-mappings";

/// Key inside [`MAPPINGS_CONFIGMAP`] holding the serialized index.
pub const MAPPINGS_CONFIGMAP_KEY: &str = "mappings.json";

/// Separator used when encoding virtual identity into a host name.
pub const NAME_SEPARATOR: &str = "-x-";

/// Field manager reported on all syncer writes.
pub const FIELD_MANAGER: &str = "enclave-syncer";

/// Event reason emitted when a host object already exists at the computed
/// destination name without our markers.
pub const REASON_SYNC_COLLISION: &str = "SyncCollision";

/// Event reason emitted when the host API rejects a projected object.
pub const REASON_SYNC_ERROR: &str = "SyncError";

/// Event reason emitted when a three-way merge resolves a both-sides
/// conflict in favor of the virtual spec.
pub const REASON_SYNC_CONFLICT: &str = "SyncConflict";
