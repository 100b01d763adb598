//! agenthq: control plane for multiplexing agent PTY sessions.
//!
//! A central server brokers every byte between remote daemons (which fork
//! the actual agent processes on developer VMs) and browser clients (which
//! attach to view output and send keystrokes). The server never launches a
//! PTY itself; it routes frames, tracks domain state, and replays buffered
//! output to late joiners.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP + WebSocket transport surface.
pub mod api;
/// Password, PIN and session authentication.
pub mod auth;
/// Persisted workspace configuration.
pub mod config;
/// Domain entities, stores, and the frame-routing broker.
pub mod core;
/// Connection registries for daemons and browsers.
pub mod hub;
