//! Pod sync: the workhorse. Virtual pods project onto the host where the
//! real kubelets run them; scheduling and status are host-authoritative
//! and flow back.
//!
//! Pods reference ConfigMaps, Secrets and ServiceAccounts by name, so
//! every such reference is rewritten to the translated host name, and the
//! referenced objects are declared as dependencies that must be projected
//! first.

use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

use enclave_common::translate::Translator;
use enclave_common::Error;

use super::{DependencyRef, Direction, KindSyncer};
use crate::client::Propagation;
use crate::types::{gvks, ObjKey};

pub struct PodSyncer {
    /// Whether ServiceAccounts are synced; when off, pods run under the
    /// host namespace's default account with automounting disabled
    pub sync_service_accounts: bool,
}

impl KindSyncer for PodSyncer {
    fn gvk(&self) -> GroupVersionKind {
        gvks::pod()
    }

    fn direction(&self) -> Direction {
        Direction::Hostward
    }

    fn mutation_allowed(&self) -> &'static [&'static str] {
        &[
            "spec.nodeName",
            "spec.tolerations",
            "spec.ephemeralContainers",
            "spec.schedulerName",
            "spec.priority",
        ]
    }

    fn dependencies(&self, v: &DynamicObject) -> Vec<DependencyRef> {
        let namespace = v.metadata.namespace.clone().unwrap_or_default();
        let mut deps = Vec::new();
        let mut push = |gvk: GroupVersionKind, name: &str| {
            let dep = DependencyRef {
                gvk,
                key: ObjKey::namespaced(namespace.clone(), name),
            };
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        };

        let Some(spec) = v.data.get("spec") else {
            return deps;
        };

        for volume in array(spec, "volumes") {
            if let Some(name) = volume.pointer("/configMap/name").and_then(Value::as_str) {
                push(gvks::config_map(), name);
            }
            if let Some(name) = volume.pointer("/secret/secretName").and_then(Value::as_str) {
                push(gvks::secret(), name);
            }
            for source in array(volume, "projected/sources") {
                if let Some(name) = source.pointer("/configMap/name").and_then(Value::as_str) {
                    push(gvks::config_map(), name);
                }
                if let Some(name) = source.pointer("/secret/name").and_then(Value::as_str) {
                    push(gvks::secret(), name);
                }
            }
        }

        for container in containers(spec) {
            for env in array(container, "env") {
                if let Some(name) = env
                    .pointer("/valueFrom/configMapKeyRef/name")
                    .and_then(Value::as_str)
                {
                    push(gvks::config_map(), name);
                }
                if let Some(name) = env
                    .pointer("/valueFrom/secretKeyRef/name")
                    .and_then(Value::as_str)
                {
                    push(gvks::secret(), name);
                }
            }
            for env_from in array(container, "envFrom") {
                if let Some(name) = env_from.pointer("/configMapRef/name").and_then(Value::as_str) {
                    push(gvks::config_map(), name);
                }
                if let Some(name) = env_from.pointer("/secretRef/name").and_then(Value::as_str) {
                    push(gvks::secret(), name);
                }
            }
        }

        for pull_secret in array(spec, "imagePullSecrets") {
            if let Some(name) = pull_secret.get("name").and_then(Value::as_str) {
                push(gvks::secret(), name);
            }
        }

        if self.sync_service_accounts {
            if let Some(name) = spec.get("serviceAccountName").and_then(Value::as_str) {
                push(gvks::service_account(), name);
            }
        }

        deps
    }

    fn desired_host_body(
        &self,
        v: &DynamicObject,
        translator: &Translator,
    ) -> Result<Value, Error> {
        let namespace = v.metadata.namespace.clone().unwrap_or_default();
        let rename = |name: &str| translator.host_name(name, &namespace);

        let mut body = v.data.clone();
        if let Some(map) = body.as_object_mut() {
            map.remove("status");
        }

        let Some(spec) = body.get_mut("spec").and_then(Value::as_object_mut) else {
            return Ok(body);
        };

        // the host scheduler places the pod
        spec.remove("nodeName");

        for volume in array_mut(spec, "volumes") {
            rewrite(volume, "/configMap/name", &rename);
            rewrite(volume, "/secret/secretName", &rename);
            if let Some(sources) = volume
                .pointer_mut("/projected/sources")
                .and_then(Value::as_array_mut)
            {
                for source in sources {
                    rewrite(source, "/configMap/name", &rename);
                    rewrite(source, "/secret/name", &rename);
                }
            }
        }

        for key in ["containers", "initContainers", "ephemeralContainers"] {
            for container in array_mut(spec, key) {
                if let Some(envs) = container.get_mut("env").and_then(Value::as_array_mut) {
                    for env in envs {
                        rewrite(env, "/valueFrom/configMapKeyRef/name", &rename);
                        rewrite(env, "/valueFrom/secretKeyRef/name", &rename);
                    }
                }
                if let Some(env_froms) = container.get_mut("envFrom").and_then(Value::as_array_mut)
                {
                    for env_from in env_froms {
                        rewrite(env_from, "/configMapRef/name", &rename);
                        rewrite(env_from, "/secretRef/name", &rename);
                    }
                }
            }
        }

        if let Some(pull_secrets) = spec.get_mut("imagePullSecrets").and_then(Value::as_array_mut) {
            for pull_secret in pull_secrets {
                rewrite(pull_secret, "/name", &rename);
            }
        }

        // deprecated alias, always dropped
        spec.remove("serviceAccount");
        if self.sync_service_accounts {
            if let Some(name) = spec.get("serviceAccountName").and_then(Value::as_str) {
                let translated = rename(name);
                spec.insert("serviceAccountName".to_string(), Value::String(translated));
            }
        } else {
            spec.remove("serviceAccountName");
            spec.insert("automountServiceAccountToken".to_string(), Value::Bool(false));
        }

        Ok(body)
    }

    fn virtual_writeback(&self, p: &DynamicObject) -> Result<Value, Error> {
        let mut patch = json!({});
        if let Some(node_name) = p.data.pointer("/spec/nodeName") {
            patch["spec"] = json!({"nodeName": node_name});
        }
        if let Some(status) = p.data.get("status") {
            patch["status"] = status.clone();
        }
        Ok(patch)
    }

    fn deletion_propagation(&self, _v: &DynamicObject) -> Propagation {
        // pods own nothing; nothing to cascade
        Propagation::Background
    }
}

fn array<'a>(value: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> {
    let path = if pointer.starts_with('/') {
        pointer.to_string()
    } else {
        format!("/{}", pointer)
    };
    value
        .pointer(&path)
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

fn array_mut<'a>(
    spec: &'a mut serde_json::Map<String, Value>,
    key: &str,
) -> impl Iterator<Item = &'a mut Value> {
    spec.get_mut(key)
        .and_then(Value::as_array_mut)
        .map(|items| items.iter_mut())
        .into_iter()
        .flatten()
}

fn containers<'a>(spec: &'a Value) -> impl Iterator<Item = &'a Value> {
    array(spec, "containers")
        .chain(array(spec, "initContainers"))
        .chain(array(spec, "ephemeralContainers"))
}

fn rewrite(value: &mut Value, pointer: &str, rename: &impl Fn(&str) -> String) {
    if let Some(target) = value.pointer_mut(pointer) {
        if let Some(name) = target.as_str() {
            *target = Value::String(rename(name));
        }
    }
}
