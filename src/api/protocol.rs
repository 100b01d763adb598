use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::core::environment::EnvironmentDto;
use crate::core::process::Process;
use crate::core::worktree::Worktree;

/// Repo descriptor carried in a daemon `repos-list` frame.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    pub name: String,
    pub path: String,
    pub default_branch: String,
}

/// Frames a daemon sends to the server.
///
/// PTY payloads are base64-encoded on this hop.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DaemonMessage {
    Register {
        env_id: String,
        env_name: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<String>,
    },
    Heartbeat,
    PtyData {
        process_id: String,
        /// base64-encoded chunk of terminal output
        data: String,
    },
    PtySize {
        process_id: String,
        cols: u16,
        rows: u16,
    },
    ProcessStarted {
        process_id: String,
    },
    ProcessExit {
        process_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    WorktreeReady {
        worktree_id: String,
        path: String,
        branch: String,
    },
    BranchChanged {
        worktree_id: String,
        branch: String,
    },
    ReposList {
        repos: Vec<RepoInfo>,
    },
}

/// Frames the server sends to a daemon.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DaemonCommand {
    CreateWorktree {
        worktree_id: String,
        repo_name: String,
        repo_path: String,
    },
    Spawn {
        process_id: String,
        worktree_id: String,
        worktree_path: String,
        agent: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        yolo_mode: Option<bool>,
    },
    PtyInput {
        process_id: String,
        /// base64-encoded keystrokes
        data: String,
    },
    Resize {
        process_id: String,
        cols: u16,
        rows: u16,
    },
    Kill {
        process_id: String,
    },
    RemoveWorktree {
        worktree_id: String,
        worktree_path: String,
    },
    ListRepos,
}

/// Frames a browser sends to the server.
///
/// PTY payloads are raw strings on this hop; the server re-encodes for the
/// daemon leg.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BrowserMessage {
    Attach {
        process_id: String,
        #[serde(default)]
        skip_buffer: bool,
    },
    Detach {
        process_id: String,
    },
    Input {
        process_id: String,
        data: String,
    },
    Resize {
        process_id: String,
        cols: u16,
        rows: u16,
    },
}

/// Frames the server sends to browsers.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BrowserEvent {
    PtyData {
        process_id: String,
        data: String,
    },
    PtySize {
        process_id: String,
        cols: u16,
        rows: u16,
    },
    ProcessUpdate {
        process: Process,
    },
    ProcessRemoved {
        process_id: String,
    },
    WorktreeUpdate {
        worktree: Worktree,
    },
    WorktreeRemoved {
        worktree_id: String,
    },
    EnvUpdate {
        environments: Vec<EnvironmentDto>,
    },
    Error {
        message: String,
    },
}
