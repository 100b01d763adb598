use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::repo::Repo;

/// Alphabet for generated worktree ids.
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated worktree ids.
const ID_LENGTH: usize = 12;

/// A filesystem checkout tied to a repo and a branch; the spawn target for
/// processes.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    pub id: String,
    pub repo_name: String,
    /// Empty until the daemon reports `worktree-ready`.
    pub path: String,
    pub branch: String,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<String>,
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,
}

impl Worktree {
    /// A worktree is ready once its checkout path is known.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.path.is_empty()
    }
}

/// Generate an opaque short worktree id.
#[must_use]
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..ID_CHARSET.len());
            ID_CHARSET[idx] as char
        })
        .collect()
}

/// In-memory worktree records keyed by id.
#[derive(Debug, Default)]
pub struct WorktreeStore {
    worktrees: RwLock<HashMap<String, Worktree>>,
}

impl WorktreeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed (or fetch) the main worktree for a repo.
    ///
    /// The main worktree has the deterministic id `main-<repoName>` and
    /// mirrors the repo's primary checkout; repeated calls return the
    /// existing record.
    pub fn register_main(&self, repo: &Repo) -> Worktree {
        let id = format!("main-{}", repo.name);
        let mut worktrees = self.worktrees.write().unwrap_or_else(|e| e.into_inner());
        worktrees
            .entry(id.clone())
            .or_insert_with(|| Worktree {
                id,
                repo_name: repo.name.clone(),
                path: repo.path.clone(),
                branch: repo.default_branch.clone(),
                is_main: true,
                env_id: repo.env_id.clone(),
                created_at: Utc::now(),
            })
            .clone()
    }

    pub fn insert(&self, worktree: Worktree) {
        let mut worktrees = self.worktrees.write().unwrap_or_else(|e| e.into_inner());
        worktrees.insert(worktree.id.clone(), worktree);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Worktree> {
        let worktrees = self.worktrees.read().unwrap_or_else(|e| e.into_inner());
        worktrees.get(id).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Worktree> {
        let worktrees = self.worktrees.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Worktree> = worktrees.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Fill in the checkout path reported by `worktree-ready`.
    pub fn mark_ready(&self, id: &str, path: &str, branch: &str) -> Option<Worktree> {
        let mut worktrees = self.worktrees.write().unwrap_or_else(|e| e.into_inner());
        let worktree = worktrees.get_mut(id)?;
        worktree.path = path.to_string();
        worktree.branch = branch.to_string();
        Some(worktree.clone())
    }

    /// Apply a `branch-changed` report.
    pub fn set_branch(&self, id: &str, branch: &str) -> Option<Worktree> {
        let mut worktrees = self.worktrees.write().unwrap_or_else(|e| e.into_inner());
        let worktree = worktrees.get_mut(id)?;
        worktree.branch = branch.to_string();
        Some(worktree.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Worktree> {
        let mut worktrees = self.worktrees.write().unwrap_or_else(|e| e.into_inner());
        worktrees.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repo {
        Repo {
            name: "alpha".into(),
            path: "/w/alpha".into(),
            default_branch: "main".into(),
            env_id: Some("local".into()),
        }
    }

    #[test]
    fn register_main_is_idempotent() {
        let store = WorktreeStore::new();
        let first = store.register_main(&repo());
        let second = store.register_main(&repo());

        assert_eq!(first.id, "main-alpha");
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(first.is_main);
        assert_eq!(first.path, "/w/alpha");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn generated_ids_are_short_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }

    #[test]
    fn readiness_follows_path() {
        let store = WorktreeStore::new();
        store.insert(Worktree {
            id: "w1".into(),
            repo_name: "alpha".into(),
            path: String::new(),
            branch: "agent/w1".into(),
            is_main: false,
            env_id: Some("local".into()),
            created_at: Utc::now(),
        });

        assert!(!store.get("w1").unwrap().is_ready());
        store.mark_ready("w1", "/w/alpha-w1", "agent/w1");
        assert!(store.get("w1").unwrap().is_ready());
    }
}
