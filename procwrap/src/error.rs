//! Error types shared by the process lifecycle, coordinator and pool.

use std::io;

use thiserror::Error;

/// Errors raised by process handles and pools.
///
/// A timeout is not an error: the child is killed and the kill shows up in
/// the exit code.
#[derive(Debug, Error)]
pub enum ProcError {
    /// The operation is not valid in the current lifecycle state.
    #[error("usage error: {0}")]
    Usage(String),

    /// The OS refused to create the process.
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Querying the status of a running child failed.
    #[error("failed to query status of process {pid}")]
    StatusQuery {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Installing the parent end of a pipe failed after spawn.
    #[error("failed to set up pipe for descriptor {number}")]
    Pipe {
        number: u32,
        #[source]
        source: io::Error,
    },
}

impl ProcError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Whether this error was raised before touching the OS.
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

/// Result alias for process operations.
pub type Result<T> = std::result::Result<T, ProcError>;
