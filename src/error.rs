//! Error types for stampede.

use thiserror::Error;

/// Main error type for stampede.
#[derive(Error, Debug)]
pub enum StampedeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed pipe message: {0}")]
    Protocol(String),

    #[error("peer process has gone away")]
    PeerGone,

    #[error("engine error: {0}")]
    Engine(String),

    #[error("worker error: {0}")]
    Worker(String),
}

/// Result type alias for stampede operations.
pub type Result<T> = std::result::Result<T, StampedeError>;
