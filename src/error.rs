//! Error types for the server, the RPC client and the load harness.
//!
//! Nothing in the harness is retried: every [`HarnessError`] ends the run.

use std::io;
use std::path::PathBuf;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of a single `Get` call at the transport level.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// Socket read/write failed. Kept as a string so every pending call
    /// can receive its own copy.
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection closed before the response arrived.
    #[error("connection closed")]
    Disconnected,

    /// The server answered the call with an error frame.
    #[error("remote error: {0}")]
    Remote(String),

    /// The peer sent something the framing does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<io::Error> for CallError {
    fn from(e: io::Error) -> Self {
        CallError::Io(e.to_string())
    }
}

/// Fatal conditions that end a load run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("worker {worker}: call failed: {source}")]
    Call { worker: usize, source: CallError },

    #[error("worker {worker}: response mismatch (expected {expected:?}, got {actual:?})")]
    Mismatch {
        worker: usize,
        expected: String,
        actual: String,
    },

    #[error("{task} task panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("failed to emit report: {0}")]
    Report(#[from] io::Error),
}
