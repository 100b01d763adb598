use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::ws_browser::ws_browser_handler;
use super::ws_daemon::ws_daemon_handler;
use crate::auth::{self, AuthStore};
use crate::core::Broker;
use crate::core::errors::BrokerError;

/// Shared state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub auth: AuthStore,
    /// Workspace directory scanned for local repos.
    pub workspace: PathBuf,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// Create the HTTP router with every endpoint wired to `state`.
///
/// All `/api` routes except the auth endpoints require a valid session;
/// `/ws/daemon` and `/ws/browser` run their own walls inside the handler.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route(
            "/api/environments",
            get(handlers::list_environments).post(handlers::create_environment),
        )
        .route("/api/environments/{id}", delete(handlers::delete_environment))
        .route("/api/repos", get(handlers::list_repos))
        .route("/api/repos/{name}/worktrees", post(handlers::create_worktree))
        .route("/api/worktrees", get(handlers::list_worktrees))
        .route("/api/worktrees/{id}", delete(handlers::delete_worktree))
        .route("/api/worktrees/{id}/processes", post(handlers::spawn_process))
        .route("/api/worktrees/{id}/diff", post(handlers::diff_worktree))
        .route("/api/worktrees/{id}/merge", post(handlers::merge_worktree))
        .route("/api/processes", get(handlers::list_processes))
        .route(
            "/api/processes/{id}",
            get(handlers::get_process).delete(handlers::delete_process),
        )
        .route("/api/processes/{id}/buffer", get(handlers::get_process_buffer))
        .route_layer(from_fn_with_state(state.clone(), auth::require_session));

    Router::new()
        .route("/api/auth/login", post(auth::handlers::login))
        .route("/api/auth/pin-login", post(auth::handlers::pin_login))
        .route("/api/auth/logout", post(auth::handlers::logout))
        .route("/api/auth/me", get(auth::handlers::me))
        .merge(protected)
        .route("/ws/daemon", get(ws_daemon_handler))
        .route("/ws/browser", get(ws_browser_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Custom error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    Broker(BrokerError),
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        Self::Broker(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            Self::Broker(err) => match err {
                BrokerError::Validation(msg) | BrokerError::Precondition(msg) => {
                    (StatusCode::BAD_REQUEST, msg)
                }
                BrokerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
                BrokerError::Transport(_) => {
                    tracing::error!("Daemon delivery failed: {err}");
                    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
            },
            Self::Internal(err) => {
                tracing::error!("Internal error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal error: {err}"),
                )
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
