//! Key and GVK helpers shared by the cache, queue and sync layers.

use std::fmt;

use kube::api::{ApiResource, GroupVersionKind, TypeMeta};

/// Identity of an object within one cluster: namespace (absent for
/// cluster-scoped kinds) and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjKey {
    /// A namespaced key
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// A cluster-scoped key
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// The wire encoding used in the mapping snapshot: `<namespace>/<name>`
    /// with an empty namespace segment for cluster-scoped keys.
    pub fn encode(&self) -> String {
        format!("{}/{}", self.namespace.as_deref().unwrap_or(""), self.name)
    }

    /// Parse the wire encoding produced by [`ObjKey::encode`]
    pub fn decode(encoded: &str) -> Option<Self> {
        let (namespace, name) = encoded.split_once('/')?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Stable string form of a GVK, used as a map key and in the mapping
/// snapshot (`v1/Service`, `storage.k8s.io/v1/StorageClass`).
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Build the [`ApiResource`] for a GVK with a correctly pluralized path
/// segment.
pub fn api_resource(gvk: &GroupVersionKind) -> ApiResource {
    ApiResource::from_gvk_with_plural(gvk, &pluralize(&gvk.kind))
}

/// TypeMeta for an object of the given GVK
pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    TypeMeta {
        api_version: if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        },
        kind: gvk.kind.clone(),
    }
}

/// Pluralization for the builtin kinds the syncer handles.
fn pluralize(kind: &str) -> String {
    // Endpoints is already plural on the wire
    if kind == "Endpoints" {
        return "endpoints".to_string();
    }

    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if lower.ends_with('y') {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// GVK shorthands for the kinds the syncer ships.
pub mod gvks {
    use kube::api::GroupVersionKind;

    pub fn service() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Service")
    }

    pub fn config_map() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    pub fn secret() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Secret")
    }

    pub fn service_account() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ServiceAccount")
    }

    pub fn pod() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Pod")
    }

    pub fn endpoints() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Endpoints")
    }

    pub fn persistent_volume() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "PersistentVolume")
    }

    pub fn node() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Node")
    }

    pub fn storage_class() -> GroupVersionKind {
        GroupVersionKind::gvk("storage.k8s.io", "v1", "StorageClass")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_key_display_and_encoding() {
        let namespaced = ObjKey::namespaced("ns", "web");
        assert_eq!(namespaced.to_string(), "ns/web");
        assert_eq!(namespaced.encode(), "ns/web");
        assert_eq!(ObjKey::decode("ns/web"), Some(namespaced));

        let cluster = ObjKey::cluster("fast-ssd");
        assert_eq!(cluster.to_string(), "fast-ssd");
        assert_eq!(cluster.encode(), "/fast-ssd");
        assert_eq!(ObjKey::decode("/fast-ssd"), Some(cluster));

        assert_eq!(ObjKey::decode("no-separator-name/"), None);
    }

    #[test]
    fn gvk_keys_omit_empty_core_group() {
        assert_eq!(gvk_key(&gvks::service()), "v1/Service");
        assert_eq!(gvk_key(&gvks::storage_class()), "storage.k8s.io/v1/StorageClass");
    }

    #[test]
    fn pluralization_covers_shipped_kinds() {
        assert_eq!(pluralize("Service"), "services");
        assert_eq!(pluralize("ConfigMap"), "configmaps");
        assert_eq!(pluralize("Endpoints"), "endpoints");
        assert_eq!(pluralize("StorageClass"), "storageclasses");
        assert_eq!(pluralize("NetworkPolicy"), "networkpolicies");
    }
}
