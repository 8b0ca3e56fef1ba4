//! Client error types.

use std::fmt;
use std::io;

use thiserror::Error;

use cmserver_core::CacheError;
use cmserver_protocol::ProtocolError;

use crate::state::ServerState;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by the protocol client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// IO error on the pipe or the process.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Framing or decoding error. Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The backend answered this one request with an error.
    #[error("backend rejected {in_reply_to} request: {message}")]
    Server {
        cookie: String,
        in_reply_to: String,
        message: String,
    },

    /// The connection went away before a reply arrived.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: DrainReason },

    /// The backend could not be started or refused the handshake.
    #[error("startup failed: {0}")]
    Startup(#[from] StartupError),

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} while the client is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    /// A reply did not have the expected shape.
    #[error("unexpected reply to {in_reply_to}: {source}")]
    UnexpectedReply {
        in_reply_to: String,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A CLI command could not produce its output.
    #[error("command failed: {0}")]
    Command(String),
}

impl ClientError {
    pub(crate) fn closed(reason: DrainReason) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Returns true if the error means the whole connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

/// Why pending requests were rejected in bulk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    /// `shutdown()` was called.
    Shutdown,
    /// The backend died while it was expected to be running.
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The backend exited cleanly without being asked to.
    BackendExited,
    /// The pipe or the framing failed.
    TransportFailed(String),
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "client shut down"),
            Self::Crashed { code, signal } => {
                write!(f, "backend crashed")?;
                write_exit(f, *code, *signal)
            }
            Self::BackendExited => write!(f, "backend exited"),
            Self::TransportFailed(msg) => write!(f, "transport failed: {}", msg),
        }
    }
}

/// Errors that keep a client from reaching the ready state.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The backend executable could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Another process is listening on the pipe path.
    #[error("pipe path already in use: {path}")]
    PipeInUse { path: String },

    /// The pipe never accepted a connection.
    #[error("could not connect to {path} after {attempts} attempts: {source}")]
    PipeConnect {
        path: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The backend exited before the handshake completed.
    #[error("backend exited during startup{}{}", ExitSuffix(*code, *signal), DiagnosticSuffix(diagnostic))]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
        diagnostic: String,
    },

    /// No generator could be chosen for a build directory without a cache.
    #[error("no usable generator found; set one in the configuration or pass --generator")]
    NoGenerator,

    /// The build directory was configured from a different source directory.
    #[error(
        "build directory cache at {cache_path} was generated for {cached}, not {expecting}"
    )]
    BadHomeDirectory {
        cached: String,
        expecting: String,
        cache_path: String,
    },

    /// The backend refused the handshake for another reason.
    #[error("handshake rejected: {message}")]
    HandshakeRejected { message: String },

    /// The backend offered no protocol version.
    #[error("backend advertised no supported protocol version")]
    UnsupportedProtocol,

    /// The existing cache could not be read.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

struct ExitSuffix(Option<i32>, Option<i32>);

impl fmt::Display for ExitSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_exit(f, self.0, self.1)
    }
}

struct DiagnosticSuffix<'a>(&'a str);

impl fmt::Display for DiagnosticSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            Ok(())
        } else {
            write!(f, ": {}", self.0)
        }
    }
}

fn write_exit(f: &mut fmt::Formatter<'_>, code: Option<i32>, signal: Option<i32>) -> fmt::Result {
    match (code, signal) {
        (Some(code), _) => write!(f, " with exit code {}", code),
        (None, Some(signal)) => write!(f, " from signal {}", signal),
        (None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_exited_message_includes_diagnostic() {
        let err = StartupError::ProcessExited {
            code: Some(1),
            signal: None,
            diagnostic: "CMake Error: bad flag".into(),
        };
        assert_eq!(
            err.to_string(),
            "backend exited during startup with exit code 1: CMake Error: bad flag"
        );

        let err = StartupError::ProcessExited {
            code: None,
            signal: Some(9),
            diagnostic: String::new(),
        };
        assert_eq!(err.to_string(), "backend exited during startup from signal 9");
    }

    #[test]
    fn drain_reason_display() {
        let err = ClientError::closed(DrainReason::Crashed {
            code: Some(3),
            signal: None,
        });
        assert!(err.is_connection_closed());
        assert_eq!(
            err.to_string(),
            "connection closed: backend crashed with exit code 3"
        );
    }

    #[test]
    fn server_error_names_request() {
        let err = ClientError::Server {
            cookie: "4".into(),
            in_reply_to: "configure".into(),
            message: "no CMakeLists.txt".into(),
        };
        assert_eq!(
            err.to_string(),
            "backend rejected configure request: no CMakeLists.txt"
        );
        assert!(!err.is_connection_closed());
    }
}
