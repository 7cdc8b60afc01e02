//! Crate-wide error type.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;

/// Result alias used throughout the server.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the server, its sessions and its configuration layer.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Client input grew past the buffer limit without a delimiter.
    #[error("input exceeds {limit} bytes without a delimiter")]
    Oversized {
        /// Configured buffer limit in bytes.
        limit: usize,
    },
    /// Failure reported by the statement or storage engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Invalid argument supplied by a caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
