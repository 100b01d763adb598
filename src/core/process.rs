use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use super::buffer::OutputBuffer;

/// Lifecycle state of a PTY process.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawn command sent, no output observed yet.
    Pending,
    /// The daemon confirmed the process (or emitted output).
    Running,
    /// Exited, or orphaned by a daemon disconnect.
    Stopped,
    Error,
}

/// An interactive PTY hosting an agent or shell, attached to one worktree.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: String,
    pub worktree_id: String,
    pub agent: String,
    pub env_id: String,
    pub status: ProcessStatus,
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// In-memory process records plus per-process output buffers.
///
/// The record map uses a plain `RwLock`; buffers live in a `DashMap` so the
/// hot `pty-data` append path doesn't contend with record reads.
#[derive(Debug, Default)]
pub struct ProcessStore {
    processes: RwLock<HashMap<String, Process>>,
    buffers: DashMap<String, OutputBuffer>,
}

impl ProcessStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, process: Process) {
        let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
        processes.insert(process.id.clone(), process);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Process> {
        let processes = self.processes.read().unwrap_or_else(|e| e.into_inner());
        processes.get(id).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Process> {
        let processes = self.processes.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Process> = processes.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    #[must_use]
    pub fn list_for_worktree(&self, worktree_id: &str) -> Vec<Process> {
        self.list()
            .into_iter()
            .filter(|process| process.worktree_id == worktree_id)
            .collect()
    }

    /// Remove the record and its buffer.
    pub fn remove(&self, id: &str) -> Option<Process> {
        let removed = {
            let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
            processes.remove(id)
        };
        self.buffers.remove(id);
        removed
    }

    /// Transition `pending -> running`; returns the updated record only if
    /// a transition actually happened.
    pub fn mark_running(&self, id: &str) -> Option<Process> {
        let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
        let process = processes.get_mut(id)?;
        if process.status != ProcessStatus::Pending {
            return None;
        }
        process.status = ProcessStatus::Running;
        Some(process.clone())
    }

    /// Apply a `process-exit` report.
    pub fn mark_exited(&self, id: &str, exit_code: Option<i32>) -> Option<Process> {
        let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
        let process = processes.get_mut(id)?;
        process.status = ProcessStatus::Stopped;
        process.exit_code = exit_code;
        Some(process.clone())
    }

    /// Daemon disconnect cascade: every `pending`/`running` process in the
    /// environment becomes `stopped` with no exit code. Buffers are kept so
    /// detached browsers can still fetch final output.
    pub fn stop_all_for_env(&self, env_id: &str) -> Vec<Process> {
        let mut processes = self.processes.write().unwrap_or_else(|e| e.into_inner());
        let mut stopped = Vec::new();
        for process in processes.values_mut() {
            if process.env_id == env_id
                && matches!(process.status, ProcessStatus::Pending | ProcessStatus::Running)
            {
                process.status = ProcessStatus::Stopped;
                stopped.push(process.clone());
            }
        }
        stopped.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stopped
    }

    pub fn append_buffer(&self, id: &str, bytes: &[u8]) {
        self.buffers.entry(id.to_string()).or_default().append(bytes);
    }

    #[must_use]
    pub fn buffer_snapshot(&self, id: &str) -> Vec<u8> {
        self.buffers
            .get(id)
            .map(|buffer| buffer.snapshot())
            .unwrap_or_default()
    }

    pub fn clear_buffer(&self, id: &str) {
        if let Some(mut buffer) = self.buffers.get_mut(id) {
            buffer.clear();
        }
    }
}
