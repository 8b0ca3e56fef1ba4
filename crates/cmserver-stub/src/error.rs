//! Stub backend error types.

use std::io;
use thiserror::Error;

/// Result type for stub operations.
pub type StubResult<T> = Result<T, StubError>;

/// Errors that can occur in the stub backend.
#[derive(Debug, Error)]
pub enum StubError {
    /// IO error (pipe, cache file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] cmserver_protocol::ProtocolError),

    /// Pipe path already in use.
    #[error("Pipe path already in use: {path}")]
    PipeInUse { path: String },

    /// Pipe path parent directory does not exist.
    #[error("Pipe path parent directory does not exist: {path}")]
    PipePathInvalid { path: String },

    /// Invalid command line.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl StubError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a pipe in use error.
    pub fn pipe_in_use(path: impl Into<String>) -> Self {
        Self::PipeInUse { path: path.into() }
    }

    /// Creates a pipe path invalid error.
    pub fn pipe_path_invalid(path: impl Into<String>) -> Self {
        Self::PipePathInvalid { path: path.into() }
    }
}
