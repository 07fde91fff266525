//! Bidirectional label and annotation sync.
//!
//! User labels flow both directions with last-writer-wins resolution. The
//! previous synced set is recorded in the `labels-apply` annotation on the
//! host object; a side that diverged from that set is the writer. When both
//! sides moved, the virtual side wins, matching the spec-authoritative
//! direction of the owning object. System markers never sync.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use enclave_common::constants::MARKER_PREFIX;

/// The synced sets recorded in the `labels-apply` annotation between
/// reconciles.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncedSets {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl SyncedSets {
    /// Parse the annotation payload; an absent or corrupt payload is an
    /// empty set, which makes both sides writers on the next pass.
    pub fn parse(payload: Option<&str>) -> Self {
        payload
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// Serialize for the annotation
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Patches and bookkeeping produced by one label sync
#[derive(Debug, Default, PartialEq)]
pub struct LabelSyncOutcome {
    /// Key changes for the virtual object (`None` value = delete)
    pub virtual_patch: BTreeMap<String, Option<String>>,
    /// Key changes for the host object (`None` value = delete)
    pub host_patch: BTreeMap<String, Option<String>>,
    /// The new synced set, to be written into the `labels-apply` annotation
    pub applied: BTreeMap<String, String>,
}

impl LabelSyncOutcome {
    /// Whether either side needs a write
    pub fn is_noop(&self) -> bool {
        self.virtual_patch.is_empty() && self.host_patch.is_empty()
    }
}

/// Reconcile the user label sets of both sides against the last synced set.
pub fn sync_bidirectional(
    virtual_labels: &BTreeMap<String, String>,
    host_labels: &BTreeMap<String, String>,
    last_applied: &BTreeMap<String, String>,
) -> LabelSyncOutcome {
    let mut outcome = LabelSyncOutcome::default();

    let keys: BTreeSet<&String> = virtual_labels
        .keys()
        .chain(host_labels.keys())
        .chain(last_applied.keys())
        .filter(|key| !key.starts_with(MARKER_PREFIX))
        .collect();

    for key in keys {
        let v = virtual_labels.get(key);
        let p = host_labels.get(key);
        let last = last_applied.get(key);

        let winner = if v != last {
            v
        } else if p != last {
            p
        } else {
            last
        };

        if p != winner {
            outcome.host_patch.insert(key.clone(), winner.cloned());
        }
        if v != winner {
            outcome.virtual_patch.insert(key.clone(), winner.cloned());
        }
        if let Some(value) = winner {
            outcome.applied.insert(key.clone(), value.clone());
        }
    }

    outcome
}

/// Strip system markers from a label set, leaving the user labels that
/// participate in bidirectional sync.
pub fn user_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(key, _)| !key.starts_with(MARKER_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn initial_sync_propagates_virtual_labels_to_host() {
        let outcome = sync_bidirectional(
            &labels(&[("team", "a")]),
            &labels(&[]),
            &labels(&[]),
        );
        assert_eq!(outcome.host_patch.get("team"), Some(&Some("a".to_string())));
        assert!(outcome.virtual_patch.is_empty());
        assert_eq!(outcome.applied, labels(&[("team", "a")]));
    }

    #[test]
    fn host_added_labels_flow_to_virtual() {
        let outcome = sync_bidirectional(
            &labels(&[]),
            &labels(&[("zone", "b")]),
            &labels(&[]),
        );
        assert_eq!(outcome.virtual_patch.get("zone"), Some(&Some("b".to_string())));
        assert!(outcome.host_patch.is_empty());
    }

    #[test]
    fn virtual_deletion_propagates_to_host() {
        let outcome = sync_bidirectional(
            &labels(&[]),
            &labels(&[("team", "a")]),
            &labels(&[("team", "a")]),
        );
        assert_eq!(outcome.host_patch.get("team"), Some(&None));
        assert!(!outcome.applied.contains_key("team"));
    }

    #[test]
    fn host_deletion_propagates_to_virtual() {
        let outcome = sync_bidirectional(
            &labels(&[("team", "a")]),
            &labels(&[]),
            &labels(&[("team", "a")]),
        );
        assert_eq!(outcome.virtual_patch.get("team"), Some(&None));
    }

    #[test]
    fn both_sides_changed_virtual_wins() {
        let outcome = sync_bidirectional(
            &labels(&[("env", "prod")]),
            &labels(&[("env", "canary")]),
            &labels(&[("env", "dev")]),
        );
        assert_eq!(outcome.host_patch.get("env"), Some(&Some("prod".to_string())));
        assert!(outcome.virtual_patch.is_empty());
    }

    #[test]
    fn unchanged_sets_are_a_noop() {
        let set = labels(&[("team", "a"), ("env", "prod")]);
        let outcome = sync_bidirectional(&set, &set, &set);
        assert!(outcome.is_noop());
        assert_eq!(outcome.applied, set);
    }

    #[test]
    fn markers_never_participate() {
        let outcome = sync_bidirectional(
            &labels(&[]),
            &labels(&[("vcluster.loft.sh/managed-by", "vc"), ("zone", "b")]),
            &labels(&[]),
        );
        assert!(!outcome.virtual_patch.contains_key("vcluster.loft.sh/managed-by"));
        assert_eq!(outcome.virtual_patch.len(), 1);
    }

    #[test]
    fn round_trip_reaches_steady_state() {
        // sync, apply both patches, sync again: second pass is a no-op
        let mut v = labels(&[("a", "1")]);
        let mut p = labels(&[("b", "2")]);
        let last = labels(&[]);

        let outcome = sync_bidirectional(&v, &p, &last);
        for (key, change) in &outcome.host_patch {
            match change {
                Some(value) => {
                    p.insert(key.clone(), value.clone());
                }
                None => {
                    p.remove(key);
                }
            }
        }
        for (key, change) in &outcome.virtual_patch {
            match change {
                Some(value) => {
                    v.insert(key.clone(), value.clone());
                }
                None => {
                    v.remove(key);
                }
            }
        }

        let second = sync_bidirectional(&v, &p, &outcome.applied);
        assert!(second.is_noop());
        assert_eq!(v, labels(&[("a", "1"), ("b", "2")]));
        assert_eq!(p, v);
    }
}
