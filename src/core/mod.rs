/// The frame-routing broker coordinating stores and hubs.
pub mod broker;
/// Bounded per-process PTY output window.
pub mod buffer;
/// Environment config/runtime split and store.
pub mod environment;
/// Broker-facing error taxonomy.
pub mod errors;
/// Process records, statuses, and output buffers.
pub mod process;
/// Repo inventory (scanned and daemon-reported).
pub mod repo;
/// Worktree records and id generation.
pub mod worktree;

pub use broker::{Broker, SpawnSpec};
pub use buffer::{OutputBuffer, MAX_BUFFER_BYTES};
pub use environment::{
    EnvironmentConfig, EnvironmentDto, EnvironmentStatus, EnvironmentStore, EnvironmentType,
};
pub use errors::BrokerError;
pub use process::{Process, ProcessStatus, ProcessStore};
pub use repo::{Repo, RepoStore};
pub use worktree::{Worktree, WorktreeStore};
