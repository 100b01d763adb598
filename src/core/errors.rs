use thiserror::Error;

/// Errors surfaced by broker operations to the HTTP layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The caller sent impossible input; no store mutation happened.
    #[error("{0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The entity exists but is not in a state that allows the operation
    /// (worktree not ready, environment not connected).
    #[error("{0}")]
    Precondition(String),

    /// The outbound daemon write failed; any record created in the same
    /// request has been rolled back.
    #[error("failed to deliver command to daemon for environment {0}")]
    Transport(String),
}
