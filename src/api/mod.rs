/// Control-surface HTTP handlers.
pub mod handlers;
/// Router, shared state, and error mapping.
pub mod http_server;
/// Wire frames for both socket families.
pub mod protocol;
/// /ws/browser upgrade and connection loop.
pub mod ws_browser;
/// /ws/daemon upgrade and connection loop.
pub mod ws_daemon;

pub use http_server::{AppError, AppState, create_router};
pub use protocol::{BrowserEvent, BrowserMessage, DaemonCommand, DaemonMessage, RepoInfo};
