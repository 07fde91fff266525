//! Syncer configuration surface.
//!
//! Loaded from a YAML file mounted into the syncer pod. Only the sync
//! toggles and the experimental flags live here; cluster identity (name,
//! target namespace, kubeconfig locations) is wired through the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Top-level syncer configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncerConfig {
    /// Per-kind synchronization toggles
    pub sync: SyncConfig,
    /// Experimental feature flags
    pub experimental: ExperimentalConfig,
}

/// Per-kind synchronization toggles, split by direction
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Kinds propagated virtual → host
    pub to_host: ToHostConfig,
    /// Kinds projected host → virtual
    pub from_host: FromHostConfig,
}

/// Virtual → host sync toggles
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ToHostConfig {
    pub services: Toggle,
    pub config_maps: Toggle,
    pub secrets: Toggle,
    pub service_accounts: Toggle,
    pub pods: Toggle,
    pub persistent_volumes: Toggle,
    pub endpoints: Toggle,
    /// Multi-namespace projection mode: each virtual namespace gets its
    /// own host namespace instead of sharing one.
    pub namespaces: Toggle,
}

impl Default for ToHostConfig {
    fn default() -> Self {
        Self {
            services: Toggle::enabled(),
            config_maps: Toggle::enabled(),
            secrets: Toggle::enabled(),
            service_accounts: Toggle::disabled(),
            pods: Toggle::enabled(),
            persistent_volumes: Toggle::disabled(),
            endpoints: Toggle::enabled(),
            namespaces: Toggle::disabled(),
        }
    }
}

/// Host → virtual projection toggles
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FromHostConfig {
    pub nodes: Toggle,
    pub storage_classes: Toggle,
}

/// Experimental feature flags
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentalConfig {
    pub isolated_control_plane: IsolatedControlPlaneConfig,
}

/// Isolated control plane flags
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct IsolatedControlPlaneConfig {
    /// Headless mode disables workload sync entirely; only the
    /// admission/rewriting hooks run.
    pub headless: bool,
}

/// A single enable switch
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Toggle {
    pub enabled: bool,
}

impl Toggle {
    /// An enabled toggle
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    /// A disabled toggle
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

impl SyncerConfig {
    /// Load and validate configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: SyncerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), Error> {
        if self.experimental.isolated_control_plane.headless && self.sync.to_host.pods.enabled {
            return Err(Error::config(
                "experimental.isolatedControlPlane.headless disables workload sync; \
                 sync.toHost.pods must not be enabled",
            ));
        }
        if self.sync.to_host.pods.enabled && !self.sync.to_host.config_maps.enabled {
            return Err(Error::config(
                "sync.toHost.pods requires sync.toHost.configMaps for volume projection",
            ));
        }
        if self.sync.to_host.pods.enabled && !self.sync.to_host.secrets.enabled {
            return Err(Error::config(
                "sync.toHost.pods requires sync.toHost.secrets for volume projection",
            ));
        }
        Ok(())
    }

    /// Whether any workload sync runs at all
    pub fn workload_sync_enabled(&self) -> bool {
        !self.experimental.isolated_control_plane.headless
    }
}
