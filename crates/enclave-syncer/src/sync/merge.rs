//! Three-way merge between the last-applied, desired and live documents.
//!
//! The `apply` annotation on a host object records the digest-verified
//! last-applied document, which stands in for server-side apply ownership
//! tracking: a field is "ours" when it appears in the desired or
//! last-applied document. Live-side fields we never managed are left to
//! their host-side owners (defaulters, controllers); managed fields that
//! drift are reverted unless listed as mutation-allowed; both-sides edits
//! conflict and resolve desired-side with a warning.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Result of a three-way merge
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// JSON merge patch transforming live into the reconciled document,
    /// `None` when the sides already agree
    pub patch: Option<Value>,
    /// Dotted paths changed on both sides; resolved desired-side
    pub conflicts: Vec<String>,
}

/// Compute the merge patch bringing `live` in line with `desired`, given
/// the `last_applied` document and the mutation-allowed field paths.
pub fn three_way_merge(
    last_applied: &Value,
    desired: &Value,
    live: &Value,
    mutation_allowed: &[&str],
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let patch = merge_node(last_applied, desired, live, mutation_allowed, "", &mut outcome.conflicts);
    outcome.patch = patch;
    outcome
}

fn merge_node(
    last: &Value,
    desired: &Value,
    live: &Value,
    allowed: &[&str],
    path: &str,
    conflicts: &mut Vec<String>,
) -> Option<Value> {
    if desired == live {
        return None;
    }

    if let (Value::Object(desired_map), Value::Object(live_map)) = (desired, live) {
        let empty = Map::new();
        let last_map = last.as_object().unwrap_or(&empty);
        let mut patch = Map::new();

        let mut keys: Vec<&String> = desired_map.keys().chain(live_map.keys()).collect();
        keys.extend(last_map.keys());
        keys.sort();
        keys.dedup();

        for key in keys {
            let child_path = join_path(path, key);
            let d = desired_map.get(key);
            let l = live_map.get(key);
            let la = last_map.get(key);

            if let Some(change) = merge_field(la, d, l, allowed, &child_path, conflicts) {
                patch.insert(key.clone(), change);
            }
        }

        if patch.is_empty() {
            None
        } else {
            Some(Value::Object(patch))
        }
    } else {
        // type change at this node: treat as an atomic replacement
        merge_field(
            Some(last),
            Some(desired),
            Some(live),
            allowed,
            path,
            conflicts,
        )
    }
}

/// Decide one field. Returns the merge-patch entry for it, if any.
fn merge_field(
    last: Option<&Value>,
    desired: Option<&Value>,
    live: Option<&Value>,
    allowed: &[&str],
    path: &str,
    conflicts: &mut Vec<String>,
) -> Option<Value> {
    if desired == live {
        return None;
    }

    // descend into objects present on both sides
    if let (Some(d), Some(l)) = (desired, live) {
        if d.is_object() && l.is_object() {
            let last_child = last.cloned().unwrap_or(Value::Null);
            return merge_node(&last_child, d, l, allowed, path, conflicts);
        }
    }

    let desired_changed = desired != last;
    let live_changed = live != last;

    match (desired_changed, live_changed) {
        (false, false) => None,
        (true, false) => Some(patch_value(desired)),
        (false, true) => {
            // a field we never declared belongs to its host-side owner
            if desired.is_none() && last.is_none() {
                return None;
            }
            if is_allowed(path, allowed) {
                return None;
            }
            Some(patch_value(desired))
        }
        (true, true) => {
            conflicts.push(path.to_string());
            Some(patch_value(desired))
        }
    }
}

fn patch_value(desired: Option<&Value>) -> Value {
    desired.cloned().unwrap_or(Value::Null)
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// Whether a path is covered by the mutation-allowed set. An allowed entry
/// covers itself and everything beneath it.
fn is_allowed(path: &str, allowed: &[&str]) -> bool {
    allowed.iter().any(|entry| {
        path == *entry
            || path.starts_with(&format!("{}.", entry))
            || entry.starts_with(&format!("{}.", path))
    })
}

/// SHA-256 over the canonical JSON encoding of a document. Object keys are
/// ordered, so the digest is stable across re-serialization.
pub fn apply_digest(document: &Value) -> String {
    let canonical = serde_json::to_string(document).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Apply an RFC 7386 JSON merge patch in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let target_map = target.as_object_mut().expect("target coerced to object");
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    apply_merge_patch(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Drop patch entries whose value already matches `current`; returns
/// `None` when the patch would be a no-op. Used to keep write-backs
/// idempotent.
pub fn prune_equal(patch: Value, current: &Value) -> Option<Value> {
    match patch {
        Value::Object(map) => {
            let current_map = current.as_object();
            let mut kept = Map::new();
            for (key, value) in map {
                let current_value = current_map.and_then(|m| m.get(&key));
                match (&value, current_value) {
                    (Value::Null, None) => {}
                    (_, Some(cur)) if &value == cur => {}
                    (Value::Object(_), Some(cur)) if cur.is_object() => {
                        if let Some(pruned) = prune_equal(value, cur) {
                            kept.insert(key, pruned);
                        }
                    }
                    _ => {
                        kept.insert(key, value);
                    }
                }
            }
            if kept.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        other => {
            if &other == current {
                None
            } else {
                Some(other)
            }
        }
    }
}
