//! Error types for the devctl CLI.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use thiserror::Error;

/// CLI client errors.
///
/// Connection errors suggest checking whether the daemon is running;
/// `Daemon` carries the daemon's own error message and code verbatim.
#[derive(Error, Debug)]
pub enum CliError {
    /// Failed to connect to the daemon.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon answered with something other than what was asked for.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon rejected a request.
    #[error("{message}")]
    Daemon {
        message: String,
        code: Option<String>,
    },

    /// The daemon did not answer in time.
    #[error("Timed out waiting for the daemon")]
    Timeout,

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse error passthrough.
    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl CliError {
    /// Error code reported by the daemon, if any.
    pub fn daemon_code(&self) -> Option<&str> {
        match self {
            Self::Daemon { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Convenience Result type alias for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;
