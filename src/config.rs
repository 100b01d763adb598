use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::environment::EnvironmentConfig;

/// Directory under the workspace that holds server metadata.
pub const META_DIR: &str = ".agenthq-meta";

/// Environment variable fallback for the public server URL.
const SERVER_URL_ENV: &str = "AGENTHQ_SERVER_URL";

/// Environment variable fallback for the daemon auth token.
const DAEMON_TOKEN_ENV: &str = "AGENTHQ_DAEMON_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sprites_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    daemon_auth_token: Option<String>,
    #[serde(default)]
    environments: Vec<EnvironmentConfig>,
}

/// Persisted workspace configuration.
///
/// Reads are served from memory; every mutation rewrites the whole JSON
/// file at `<workspace>/.agenthq-meta/config.json`.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: RwLock<ConfigFile>,
}

impl ConfigStore {
    /// Load (or initialize) the config for a workspace directory.
    ///
    /// Malformed JSON is logged and replaced with defaults. The `local`
    /// environment is synthesized into the list when missing.
    ///
    /// # Errors
    /// Returns an error when the metadata directory cannot be created.
    pub fn load(workspace: &Path) -> anyhow::Result<Self> {
        let meta_dir = workspace.join(META_DIR);
        std::fs::create_dir_all(&meta_dir)
            .with_context(|| format!("creating {}", meta_dir.display()))?;
        let path = meta_dir.join("config.json");

        let mut state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<ConfigFile>(&raw).unwrap_or_else(|err| {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Malformed config file, starting from defaults"
                );
                ConfigFile::default()
            }),
            Err(_) => ConfigFile::default(),
        };

        if !state.environments.iter().any(|env| env.id == "local") {
            state.environments.insert(0, EnvironmentConfig::local());
        }

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    #[must_use]
    pub fn server_public_url(&self) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .server_public_url
            .clone()
            .or_else(|| std::env::var(SERVER_URL_ENV).ok())
    }

    /// # Errors
    /// Returns an error when the rewrite fails.
    pub fn set_server_public_url(&self, url: Option<String>) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.server_public_url = url;
        self.persist(&state)
    }

    #[must_use]
    pub fn daemon_auth_token(&self) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .daemon_auth_token
            .clone()
            .or_else(|| std::env::var(DAEMON_TOKEN_ENV).ok())
    }

    /// # Errors
    /// Returns an error when the rewrite fails.
    pub fn set_daemon_auth_token(&self, token: Option<String>) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.daemon_auth_token = token;
        self.persist(&state)
    }

    #[must_use]
    pub fn sprites_token(&self) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.sprites_token.clone()
    }

    /// # Errors
    /// Returns an error when the rewrite fails.
    pub fn set_sprites_token(&self, token: Option<String>) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.sprites_token = token;
        self.persist(&state)
    }

    #[must_use]
    pub fn environments(&self) -> Vec<EnvironmentConfig> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.environments.clone()
    }

    #[must_use]
    pub fn environment(&self, id: &str) -> Option<EnvironmentConfig> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.environments.iter().find(|env| env.id == id).cloned()
    }

    /// # Errors
    /// Returns an error when the rewrite fails.
    pub fn add_environment(&self, env: EnvironmentConfig) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.environments.retain(|existing| existing.id != env.id);
        state.environments.push(env);
        self.persist(&state)
    }

    /// # Errors
    /// Returns an error when the rewrite fails.
    pub fn update_environment(&self, env: EnvironmentConfig) -> anyhow::Result<()> {
        self.add_environment(env)
    }

    /// Remove an environment definition. The `local` environment cannot be
    /// removed; attempts are ignored.
    ///
    /// # Errors
    /// Returns an error when the rewrite fails.
    pub fn remove_environment(&self, id: &str) -> anyhow::Result<()> {
        if id == "local" {
            return Ok(());
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.environments.retain(|env| env.id != id);
        self.persist(&state)
    }

    fn persist(&self, state: &ConfigFile) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::environment::EnvironmentType;
    use tempfile::TempDir;

    #[test]
    fn local_environment_is_always_present() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        assert!(store.environment("local").is_some());

        store.remove_environment("local").unwrap();
        assert!(store.environment("local").is_some());
    }

    #[test]
    fn mutations_survive_a_reload() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        store
            .add_environment(EnvironmentConfig {
                id: "env-a".into(),
                name: "alpha".into(),
                env_type: EnvironmentType::Exe,
                vm_name: Some("vm-1".into()),
                workspace_path: None,
            })
            .unwrap();
        store.set_daemon_auth_token(Some("secret".into())).unwrap();

        let reloaded = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.environment("env-a").unwrap().name, "alpha");
        assert_eq!(reloaded.daemon_auth_token().as_deref(), Some("secret"));
    }

    #[test]
    fn malformed_config_starts_from_defaults() {
        let dir = TempDir::new().unwrap();
        let meta = dir.path().join(META_DIR);
        std::fs::create_dir_all(&meta).unwrap();
        std::fs::write(meta.join("config.json"), "{not json").unwrap();

        let store = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(store.environments().len(), 1);
    }
}
