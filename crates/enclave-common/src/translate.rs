//! Name translation between virtual and host identities.
//!
//! Forward translation is deterministic and collision-free: the virtual
//! name and namespace are encoded into the host name with a digest suffix
//! as the overflow tie-breaker, so human-readable names survive in the
//! common case and no lookup is needed on the write path. The reverse path
//! goes through the `owner-set-uid` marker first; parsing the encoded name
//! is only the fallback for legacy objects.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use sha2::{Digest, Sha256};

use crate::constants::{
    MANAGED_BY_LABEL, NAME_SEPARATOR, OWNER_SET_UID_ANNOTATION,
};

/// Kubernetes object name length limit.
const MAX_NAME_LENGTH: usize = 63;

/// Hex digits of the SHA-256 digest kept as the truncation suffix.
const DIGEST_SUFFIX_LENGTH: usize = 10;

/// Translates identities between a virtual cluster and its host namespace.
///
/// All methods are pure; the translator holds only the virtual cluster's
/// name and the target namespace configuration.
#[derive(Debug, Clone)]
pub struct Translator {
    vcluster_name: String,
    target_namespace: String,
    multi_namespace: bool,
}

impl Translator {
    /// Create a translator for the given virtual cluster targeting a single
    /// shared host namespace.
    pub fn new(vcluster_name: impl Into<String>, target_namespace: impl Into<String>) -> Self {
        Self {
            vcluster_name: vcluster_name.into(),
            target_namespace: target_namespace.into(),
            multi_namespace: false,
        }
    }

    /// Enable multi-namespace projection: each virtual namespace maps to its
    /// own host namespace instead of the shared one.
    pub fn with_multi_namespace(mut self, enabled: bool) -> Self {
        self.multi_namespace = enabled;
        self
    }

    /// The virtual cluster's name as written into the `managed-by` marker.
    pub fn vcluster_name(&self) -> &str {
        &self.vcluster_name
    }

    /// Label selector string matching every host object this virtual
    /// cluster owns. Applied at the list/watch layer of the host informer.
    pub fn managed_by_selector(&self) -> String {
        format!("{}={}", MANAGED_BY_LABEL, self.vcluster_name)
    }

    /// Project a namespaced virtual name into the host namespace.
    ///
    /// In single-namespace mode the virtual namespace is encoded into the
    /// name (`<name>-x-<namespace>-x-<vcluster>`); in multi-namespace mode
    /// the namespace is carried by [`Translator::host_namespace`] instead
    /// and only the cluster suffix is appended.
    pub fn host_name(&self, name: &str, namespace: &str) -> String {
        if self.multi_namespace {
            safe_concat(&[name])
        } else {
            safe_concat(&[name, namespace, &self.vcluster_name])
        }
    }

    /// Project a cluster-scoped virtual name into the host cluster.
    pub fn host_name_cluster(&self, name: &str) -> String {
        safe_concat(&[name, &self.vcluster_name])
    }

    /// The host namespace a virtual namespace projects into.
    pub fn host_namespace(&self, namespace: &str) -> String {
        if self.multi_namespace {
            safe_concat(&[&self.vcluster_name, namespace])
        } else {
            self.target_namespace.clone()
        }
    }

    /// Attempt to recover `(virtual namespace, virtual name)` from an
    /// encoded host name. Only succeeds for names that were not
    /// digest-truncated; truncated names must resolve through the
    /// `owner-set-uid` marker instead.
    pub fn parse_host_name(&self, host_name: &str) -> Option<(String, String)> {
        let suffix = format!("{}{}", NAME_SEPARATOR, self.vcluster_name);
        let stripped = host_name.strip_suffix(&suffix)?;
        let (name, namespace) = stripped.rsplit_once(NAME_SEPARATOR)?;
        if name.is_empty() || namespace.is_empty() {
            return None;
        }
        Some((namespace.to_string(), name.to_string()))
    }

    /// Whether a host object carries our `managed-by` marker.
    pub fn is_managed(&self, obj: &DynamicObject) -> bool {
        obj.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MANAGED_BY_LABEL))
            .map(|owner| owner == &self.vcluster_name)
            .unwrap_or(false)
    }

    /// The `owner-set-uid` marker of a host object, if present.
    pub fn owner_uid<'a>(&self, obj: &'a DynamicObject) -> Option<&'a str> {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(OWNER_SET_UID_ANNOTATION))
            .map(String::as_str)
    }

    /// Stamp the ownership markers onto a host object under construction.
    ///
    /// The `apply` digest is set separately by the merge layer because it
    /// covers the final desired spec, which is not known here.
    pub fn apply_markers(&self, obj: &mut DynamicObject, owner_uid: &str) {
        let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(MANAGED_BY_LABEL.to_string(), self.vcluster_name.clone());

        let annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(OWNER_SET_UID_ANNOTATION.to_string(), owner_uid.to_string());
    }
}

/// Join name segments with the encoding separator, sanitize to a valid
/// DNS-1123 label, and keep the result within the 63-character limit by
/// replacing the overflow with a deterministic digest suffix.
///
/// The digest is computed over the full pre-truncation string, so two
/// distinct virtual identities that share a 52-character prefix still get
/// distinct host names.
pub fn safe_concat(segments: &[&str]) -> String {
    let joined = segments.join(NAME_SEPARATOR);
    let sanitized = sanitize(&joined);

    if sanitized.len() <= MAX_NAME_LENGTH {
        return sanitized;
    }

    let digest = hex_digest(&sanitized);
    let keep = MAX_NAME_LENGTH - DIGEST_SUFFIX_LENGTH - 1;
    let prefix = sanitized[..keep].trim_end_matches('-');
    format!("{}-{}", prefix, &digest[..DIGEST_SUFFIX_LENGTH])
}

/// Replace characters outside `[a-z0-9-]` and strip boundary hyphens.
fn sanitize(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '-' })
        .collect();
    lowered.trim_matches('-').to_string()
}

/// Lowercase hex SHA-256 of the input.
pub fn hex_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> Translator {
        Translator::new("vc", "host-ns")
    }

    #[test]
    fn short_names_stay_readable() {
        let tr = translator();
        assert_eq!(tr.host_name("svc", "ns"), "svc-x-ns-x-vc");
        assert_eq!(tr.host_name_cluster("fast-ssd"), "fast-ssd-x-vc");
        assert_eq!(tr.host_namespace("ns"), "host-ns");
    }

    #[test]
    fn long_names_get_digest_suffix() {
        let tr = translator();
        let long = "a".repeat(80);
        let translated = tr.host_name(&long, "ns");
        assert_eq!(translated.len(), 63);
        assert!(translated.starts_with("aaaa"));
        // the suffix is a hex digest, not the encoded tail
        assert!(!translated.ends_with("-x-vc"));
    }

    #[test]
    fn digest_suffix_preserves_uniqueness() {
        let tr = translator();
        let a = tr.host_name(&format!("{}b", "a".repeat(70)), "ns");
        let b = tr.host_name(&format!("{}c", "a".repeat(70)), "ns");
        assert_eq!(a.len(), 63);
        assert_eq!(b.len(), 63);
        assert_ne!(a, b);
    }

    #[test]
    fn translation_is_deterministic() {
        let tr = translator();
        let long = "x".repeat(90);
        assert_eq!(tr.host_name(&long, "ns"), tr.host_name(&long, "ns"));
    }

    #[test]
    fn invalid_characters_are_replaced() {
        assert_eq!(safe_concat(&["My_App", "NS"]), "my-app-x-ns");
        assert_eq!(safe_concat(&["-edge-", "ns"]), "edge--x-ns");
    }

    #[test]
    fn parse_inverts_untruncated_names() {
        let tr = translator();
        let host = tr.host_name("svc", "team-a");
        assert_eq!(tr.parse_host_name(&host), Some(("team-a".into(), "svc".into())));
    }

    #[test]
    fn parse_rejects_foreign_and_truncated_names() {
        let tr = translator();
        // wrong cluster suffix
        assert_eq!(tr.parse_host_name("svc-x-ns-x-other"), None);
        // no encoding at all
        assert_eq!(tr.parse_host_name("plain-host-object"), None);
        // digest-truncated names lose the suffix and cannot be parsed
        let truncated = tr.host_name(&"a".repeat(80), "ns");
        assert_eq!(tr.parse_host_name(&truncated), None);
    }

    #[test]
    fn multi_namespace_mode_moves_namespace_into_host_namespace() {
        let tr = Translator::new("vc", "host-ns").with_multi_namespace(true);
        assert_eq!(tr.host_name("svc", "team-a"), "svc");
        assert_eq!(tr.host_namespace("team-a"), "vc-x-team-a");
    }

    #[test]
    fn marker_stamping_and_detection() {
        let tr = translator();
        let mut obj = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        assert!(!tr.is_managed(&obj));

        tr.apply_markers(&mut obj, "uid-1234");
        assert!(tr.is_managed(&obj));
        assert_eq!(tr.owner_uid(&obj), Some("uid-1234"));
    }

    #[test]
    fn foreign_managed_by_is_not_ours() {
        let tr = translator();
        let mut obj = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(MANAGED_BY_LABEL.to_string(), "someone-else".to_string());
        assert!(!tr.is_managed(&obj));
    }

    #[test]
    fn selector_matches_wire_format() {
        assert_eq!(
            translator().managed_by_selector(),
            "vcluster.loft.sh/managed-by=vc"
        );
    }
}
