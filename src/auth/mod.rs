/// Session cookie formatting and Cookie-header parsing.
pub mod cookie;
/// Login/logout endpoints and the session-guard middleware.
pub mod handlers;
/// scrypt hashing and constant-time verification.
pub mod password;
/// Sqlite-backed users, sessions, and device PINs.
pub mod store;
/// Auth DTOs and credential validation helpers.
pub mod types;

pub use cookie::SESSION_COOKIE;
pub use handlers::{AuthError, CurrentUser, require_session};
pub use store::{AuthStore, SESSION_TTL_DAYS};
pub use types::{AuthUser, LoginOutcome};
