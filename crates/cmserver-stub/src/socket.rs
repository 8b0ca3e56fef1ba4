//! Pipe listener for the stub backend.
//!
//! Accepts a single client connection on a Unix socket and exchanges framed
//! messages with it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, trace, warn};

use cmserver_protocol::{MessageFramer, RequestEnvelope, encode_message};

use crate::error::{StubError, StubResult};

const READ_CHUNK: usize = 8 * 1024;

/// Listening end of the backend pipe.
pub struct PipeListener {
    path: PathBuf,
    listener: UnixListener,
}

impl PipeListener {
    /// Binds the pipe at `path`.
    ///
    /// A leftover socket file that nobody answers on is removed first; a live
    /// one is reported as [`StubError::PipeInUse`].
    pub async fn bind(path: impl Into<PathBuf>) -> StubResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(StubError::pipe_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if path.exists() {
            match UnixStream::connect(&path).await {
                Ok(_) => {
                    return Err(StubError::pipe_in_use(path.to_string_lossy().to_string()));
                }
                Err(_) => {
                    info!(path = %path.display(), "Removing stale pipe");
                    std::fs::remove_file(&path)?;
                }
            }
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Pipe listening");

        Ok(Self { path, listener })
    }

    /// Returns the pipe path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the client to connect.
    pub async fn accept(&self) -> StubResult<Connection> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!("Accepted client connection");
        Ok(Connection::new(stream))
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove pipe file");
            } else {
                debug!(path = %self.path.display(), "Removed pipe file");
            }
        }
    }
}

/// One request read from the pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(RequestEnvelope),
    /// A frame that did not decode into a known request.
    Invalid {
        cookie: String,
        kind: String,
        message: String,
    },
}

impl Incoming {
    fn parse(payload: &str) -> Self {
        match RequestEnvelope::decode(payload) {
            Ok(envelope) => Self::Request(envelope),
            Err(e) => {
                let value: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
                let field = |name: &str| {
                    value
                        .get(name)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                Self::Invalid {
                    cookie: field("cookie"),
                    kind: field("type"),
                    message: e.to_string(),
                }
            }
        }
    }
}

/// The connected client.
pub struct Connection {
    stream: UnixStream,
    framer: MessageFramer,
    queued: VecDeque<String>,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            framer: MessageFramer::new(),
            queued: VecDeque::new(),
        }
    }

    /// Reads the next request.
    ///
    /// Returns `Ok(None)` once the client has closed its end.
    pub async fn read_request(&mut self) -> StubResult<Option<Incoming>> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.queued.pop_front() {
                trace!(payload = %payload, "Request frame");
                return Ok(Some(Incoming::parse(&payload)));
            }

            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                if self.framer.buffered() > 0 {
                    debug!(
                        buffered = self.framer.buffered(),
                        "Discarding partial frame at end of stream"
                    );
                }
                return Ok(None);
            }
            self.queued.extend(self.framer.feed(&buf[..n])?);
        }
    }

    /// Writes one framed message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> StubResult<()> {
        let frame = encode_message(message)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Writes bytes outside any frame.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> StubResult<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }
}
