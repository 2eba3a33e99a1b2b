//! Error types for snapshot and process operations.

use std::path::PathBuf;

use thiserror::Error;

/// Everything the engine can fail with. Each variant names the operation that
/// failed so the presentation layer can show it without extra context.
#[derive(Error, Debug)]
pub enum Error {
    /// The host's state directory is missing, unreadable, or the copy failed.
    #[error("failed to capture {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing a payload over the live state failed part way.
    #[error("failed to restore snapshot {id} (host state may be partially overwritten): {source}")]
    Restore {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot not found: {0}")]
    NotFound(String),

    /// Graceful and forced termination both left matching processes alive.
    #[error("host application is still running after forced stop (pids: {})", format_pids(.pids))]
    Stop { pids: Vec<u32> },

    /// The OS refused to kill a process.
    #[error("failed to kill process {pid}: {reason}")]
    Kill { pid: u32, reason: String },

    #[error("failed to launch host application: {0}")]
    Launch(String),

    #[error("another switch is already in progress")]
    OperationInProgress,

    #[error("snapshot index is inconsistent with payloads on disk: {0}")]
    IndexConsistency(String),

    /// Removing a payload failed; the index entry was kept.
    #[error("failed to delete snapshot {id}: {source}")]
    Deletion {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read or write snapshot index {}: {reason}", path.display())]
    Index { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled before restore; host application left stopped")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
