use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use typeshare::typeshare;

use super::http_server::{AppError, AppState};
use crate::core::SpawnSpec;
use crate::core::environment::EnvironmentType;

/// Default terminal geometry for synthesized diff/merge shells.
const SCRIPT_COLS: u16 = 120;
const SCRIPT_ROWS: u16 = 30;

/// GET /api/environments
pub async fn list_environments(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(json!({ "environments": state.broker.environment_view() })))
}

/// Request to define a new environment.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
}

/// POST /api/environments
pub async fn create_environment(
    State(state): State<AppState>,
    Json(request): Json<CreateEnvironmentRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if request.name.trim().is_empty() {
        return Err(AppError::BadRequest("environment name is required".into()));
    }
    let env = state
        .broker
        .create_environment(request.name, request.env_type, request.vm_name)?;
    Ok(Json(json!({ "environment": env })))
}

/// DELETE /api/environments/{id}
pub async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.broker.delete_environment(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/repos
///
/// Rescans the workspace so the local inventory tracks checkouts created
/// outside the control plane.
pub async fn list_repos(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.broker.repos.scan_local(&state.workspace);
    Ok(Json(json!({ "repos": state.broker.repos.list() })))
}

/// GET /api/worktrees
///
/// Seeds the main worktree for every known repo on demand.
pub async fn list_worktrees(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    for repo in state.broker.repos.list() {
        state.broker.worktrees.register_main(&repo);
    }
    Ok(Json(json!({ "worktrees": state.broker.worktrees.list() })))
}

/// POST /api/repos/{name}/worktrees
pub async fn create_worktree(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let worktree = state.broker.create_worktree(&name)?;
    Ok(Json(json!({ "worktree": worktree })))
}

/// DELETE /api/worktrees/{id}
pub async fn delete_worktree(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.broker.delete_worktree(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to spawn a process on a worktree.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnProcessRequest {
    /// Agent to launch (e.g. "claude", "shell").
    pub agent: String,
    /// Optional initial task handed to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub yolo_mode: bool,
}

/// POST /api/worktrees/{id}/processes
pub async fn spawn_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SpawnProcessRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let process = state.broker.spawn_process(
        &id,
        SpawnSpec {
            agent: request.agent,
            task: request.task,
            cols: request.cols,
            rows: request.rows,
            yolo_mode: request.yolo_mode,
        },
    )?;
    Ok(Json(json!({ "process": process })))
}

/// Query parameters for process listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProcessesQuery {
    worktree_id: Option<String>,
}

/// GET /api/processes
pub async fn list_processes(
    State(state): State<AppState>,
    Query(query): Query<ListProcessesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let processes = match query.worktree_id {
        Some(worktree_id) => state.broker.processes.list_for_worktree(&worktree_id),
        None => state.broker.processes.list(),
    };
    Ok(Json(json!({ "processes": processes })))
}

/// GET /api/processes/{id}
pub async fn get_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let process = state
        .broker
        .processes
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("process not found: {id}")))?;
    Ok(Json(json!({ "process": process })))
}

/// Query parameters for process deletion.
#[derive(Debug, Deserialize)]
pub struct DeleteProcessQuery {
    #[serde(default)]
    remove: bool,
}

/// DELETE /api/processes/{id}[?remove=true]
///
/// Without `remove` this only forwards a kill; the record stays so the UI
/// can still fetch the final buffer after the daemon reports the exit.
pub async fn delete_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteProcessQuery>,
) -> Result<StatusCode, AppError> {
    if query.remove {
        state.broker.remove_process(&id)?;
    } else {
        state.broker.kill_process(&id)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/processes/{id}/buffer
pub async fn get_process_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.broker.processes.get(&id).is_none() {
        return Err(AppError::NotFound(format!("process not found: {id}")));
    }
    let snapshot = state.broker.processes.buffer_snapshot(&id);
    Ok(Json(json!({ "data": String::from_utf8_lossy(&snapshot) })))
}

/// POST /api/worktrees/{id}/diff
///
/// Spawns a shell in the worktree showing its diff against the repo's
/// default branch and returns the new process id.
pub async fn diff_worktree(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (worktree, default_branch) = script_target(&state, &id)?;
    let script = format!(
        "git --no-pager diff {default_branch}...{branch}",
        branch = worktree.branch
    );
    let process = state.broker.spawn_process(
        &id,
        SpawnSpec {
            agent: "shell".to_string(),
            task: Some(script),
            cols: SCRIPT_COLS,
            rows: SCRIPT_ROWS,
            yolo_mode: false,
        },
    )?;
    Ok(Json(json!({ "processId": process.id })))
}

/// POST /api/worktrees/{id}/merge
///
/// Spawns a shell that merges the worktree's branch back into the repo's
/// default branch and returns the new process id.
pub async fn merge_worktree(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (worktree, default_branch) = script_target(&state, &id)?;
    let script = format!(
        "git checkout {default_branch} && git merge --no-ff {branch}",
        branch = worktree.branch
    );
    let process = state.broker.spawn_process(
        &id,
        SpawnSpec {
            agent: "shell".to_string(),
            task: Some(script),
            cols: SCRIPT_COLS,
            rows: SCRIPT_ROWS,
            yolo_mode: false,
        },
    )?;
    Ok(Json(json!({ "processId": process.id })))
}

fn script_target(
    state: &AppState,
    worktree_id: &str,
) -> Result<(crate::core::Worktree, String), AppError> {
    let worktree = state
        .broker
        .worktrees
        .get(worktree_id)
        .ok_or_else(|| AppError::NotFound(format!("worktree not found: {worktree_id}")))?;
    let repo = state
        .broker
        .repos
        .get(&worktree.repo_name)
        .ok_or_else(|| AppError::NotFound(format!("repo not found: {}", worktree.repo_name)))?;
    Ok((worktree, repo.default_branch))
}
