use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Kind of execution context a daemon can claim.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    /// The host the server itself runs on.
    Local,
    /// A provisioned VM reachable over the network.
    Exe,
}

/// Persisted definition of an environment (the config half).
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    /// Stable identifier; `"local"` is reserved and always present.
    pub id: String,
    /// Display name; daemons may register by name.
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    /// VM handle for `exe` environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    /// Workspace directory the daemon serves repos from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

impl EnvironmentConfig {
    /// The implicit local environment, synthesized when missing from disk.
    #[must_use]
    pub fn local() -> Self {
        Self {
            id: "local".to_string(),
            name: "Local".to_string(),
            env_type: EnvironmentType::Local,
            vm_name: None,
            workspace_path: None,
        }
    }
}

/// Connection status of an environment as seen by the daemon hub.
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Runtime half of an environment: what the live daemon connection reports.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRuntime {
    pub status: EnvironmentStatus,
    pub capabilities: Vec<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Merged config + runtime view pushed to browsers in `env-update` frames.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDto {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    pub status: EnvironmentStatus,
    pub capabilities: Vec<String>,
    #[typeshare(serialized_as = "String")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[typeshare(serialized_as = "String")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// In-memory runtime state for environments, keyed by environment id.
///
/// Lock discipline: short synchronous critical sections only, never held
/// across await points.
#[derive(Debug, Default)]
pub struct EnvironmentStore {
    runtime: RwLock<HashMap<String, EnvironmentRuntime>>,
}

impl EnvironmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a daemon registration for `env_id`.
    pub fn mark_connected(&self, env_id: &str, capabilities: Vec<String>) {
        let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        let entry = runtime.entry(env_id.to_string()).or_default();
        entry.status = EnvironmentStatus::Connected;
        entry.capabilities = capabilities;
        entry.connected_at = Some(Utc::now());
        entry.last_heartbeat = Some(Utc::now());
    }

    /// Record the loss of the authoritative daemon connection.
    pub fn mark_disconnected(&self, env_id: &str) {
        let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        let entry = runtime.entry(env_id.to_string()).or_default();
        entry.status = EnvironmentStatus::Disconnected;
        entry.capabilities.clear();
        entry.connected_at = None;
    }

    pub fn heartbeat(&self, env_id: &str) {
        let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = runtime.get_mut(env_id) {
            entry.last_heartbeat = Some(Utc::now());
        }
    }

    /// Drop runtime state for a removed environment.
    pub fn remove(&self, env_id: &str) {
        let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        runtime.remove(env_id);
    }

    /// Merge the configured environment list with runtime state.
    ///
    /// Environments a daemon claimed without a matching config entry are
    /// appended after the configured ones.
    #[must_use]
    pub fn merged_view(&self, configs: &[EnvironmentConfig]) -> Vec<EnvironmentDto> {
        let runtime = self.runtime.read().unwrap_or_else(|e| e.into_inner());
        let mut seen: Vec<EnvironmentDto> = configs
            .iter()
            .map(|config| {
                let state = runtime.get(&config.id).cloned().unwrap_or_default();
                EnvironmentDto {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    env_type: config.env_type,
                    vm_name: config.vm_name.clone(),
                    status: state.status,
                    capabilities: state.capabilities,
                    connected_at: state.connected_at,
                    last_heartbeat: state.last_heartbeat,
                }
            })
            .collect();

        for (id, state) in runtime.iter() {
            if configs.iter().any(|config| &config.id == id) {
                continue;
            }
            seen.push(EnvironmentDto {
                id: id.clone(),
                name: id.clone(),
                env_type: EnvironmentType::Exe,
                vm_name: None,
                status: state.status,
                capabilities: state.capabilities.clone(),
                connected_at: state.connected_at,
                last_heartbeat: state.last_heartbeat,
            });
        }

        seen
    }
}
