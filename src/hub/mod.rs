//! Connection registries for the two families of long-lived sockets.
//!
//! Each WebSocket is owned by exactly one reader task; the registries hold
//! non-owning bounded senders used to enqueue outbound frames. Writes to a
//! given socket are serialized by its single writer half.

pub mod browser;
pub mod daemon;

use axum::extract::ws::{CloseFrame, Message};

pub use browser::BrowserHub;
pub use daemon::DaemonHub;

/// Depth of every per-connection outbound queue.
///
/// A browser that falls this far behind is disconnected rather than
/// allowed to stall PTY fan-out.
pub const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Orderly server-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Daemon presented a token that does not match the configured one.
pub const CLOSE_INVALID_TOKEN: u16 = 4001;

/// No daemon auth token is configured on the server.
pub const CLOSE_TOKEN_NOT_CONFIGURED: u16 = 4003;

/// Build a close frame with the given code and reason.
#[must_use]
pub fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
