use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// A git repository visible to the control plane.
///
/// For the local environment the set is derived by scanning the workspace
/// directory; for remote environments it is whatever the daemon last
/// reported in a `repos-list` frame.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    pub name: String,
    pub path: String,
    pub default_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<String>,
}

/// In-memory repo inventory keyed by repo name.
#[derive(Debug, Default)]
pub struct RepoStore {
    repos: RwLock<HashMap<String, Repo>>,
}

impl RepoStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Repo> {
        let repos = self.repos.read().unwrap_or_else(|e| e.into_inner());
        repos.get(name).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Repo> {
        let repos = self.repos.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Repo> = repos.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Replace every repo attributed to `env_id` with a fresh inventory.
    pub fn replace_for_env(&self, env_id: &str, incoming: Vec<Repo>) {
        let mut repos = self.repos.write().unwrap_or_else(|e| e.into_inner());
        repos.retain(|_, repo| repo.env_id.as_deref() != Some(env_id));
        for mut repo in incoming {
            repo.env_id = Some(env_id.to_string());
            repos.insert(repo.name.clone(), repo);
        }
    }

    /// Scan `workspace` for direct children containing a `.git` entry and
    /// record them as local repos. Returns how many were found.
    pub fn scan_local(&self, workspace: &Path) -> usize {
        let mut found = Vec::new();
        if let Ok(entries) = std::fs::read_dir(workspace) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() || !path.join(".git").exists() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                found.push(Repo {
                    name,
                    path: path.to_string_lossy().to_string(),
                    default_branch: default_branch_of(&path),
                    env_id: Some("local".to_string()),
                });
            }
        }

        let count = found.len();
        self.replace_for_env("local", found);
        count
    }
}

/// Best-effort default branch detection from `.git/HEAD`.
fn default_branch_of(repo_path: &Path) -> String {
    std::fs::read_to_string(repo_path.join(".git").join("HEAD"))
        .ok()
        .and_then(|head| {
            head.trim()
                .strip_prefix("ref: refs/heads/")
                .map(str::to_string)
        })
        .unwrap_or_else(|| "main".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_for_env_swaps_only_that_environment() {
        let store = RepoStore::new();
        store.replace_for_env(
            "local",
            vec![Repo {
                name: "alpha".into(),
                path: "/w/alpha".into(),
                default_branch: "main".into(),
                env_id: None,
            }],
        );
        store.replace_for_env(
            "env-remote",
            vec![Repo {
                name: "beta".into(),
                path: "/vm/beta".into(),
                default_branch: "master".into(),
                env_id: None,
            }],
        );

        store.replace_for_env(
            "env-remote",
            vec![Repo {
                name: "gamma".into(),
                path: "/vm/gamma".into(),
                default_branch: "main".into(),
                env_id: None,
            }],
        );

        let names: Vec<String> = store.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
        assert_eq!(store.get("gamma").unwrap().env_id.as_deref(), Some("env-remote"));
    }
}
