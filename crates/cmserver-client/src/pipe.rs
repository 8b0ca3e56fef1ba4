//! Local pipe paths and connection with backoff.
//!
//! The backend creates the pipe endpoint some time after it starts, so the
//! first connection attempts are expected to fail. Instead of sleeping for a
//! fixed time we retry on "not there yet" errors with an exponential delay.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::StartupError;

#[cfg(unix)]
pub type PipeStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type PipeStream = tokio::net::windows::named_pipe::NamedPipeClient;

const PIPE_PREFIX: &str = "cmake-server-";

/// Retry policy for the initial pipe connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Total attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            max_attempts: 60,
        }
    }
}

impl ConnectConfig {
    /// Builder: set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Builder: set max delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Builder: set max attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Returns a fresh pipe path.
///
/// On unix this is a socket file under `dir` (the system temp directory by
/// default); on Windows a `\\.\pipe\` name, and `dir` is ignored.
pub fn unique_pipe_path(dir: Option<&Path>) -> PathBuf {
    let token = format!("{PIPE_PREFIX}{}", Uuid::new_v4().simple());
    if cfg!(windows) {
        let _ = dir;
        PathBuf::from(format!(r"\\.\pipe\{token}"))
    } else {
        dir.map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir)
            .join(token)
    }
}

/// Removes a leftover pipe file nobody is listening on.
///
/// # Errors
///
/// [`StartupError::PipeInUse`] if a live listener answers on `path`.
#[cfg(unix)]
pub fn remove_stale(path: &Path) -> Result<(), StartupError> {
    if !path.exists() {
        return Ok(());
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(StartupError::PipeInUse {
            path: path.display().to_string(),
        });
    }

    debug!(path = %path.display(), "removing stale pipe file");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StartupError::PipeConnect {
            path: path.display().to_string(),
            attempts: 0,
            source: e,
        }),
    }
}

#[cfg(windows)]
pub fn remove_stale(_path: &Path) -> Result<(), StartupError> {
    Ok(())
}

/// One connection attempt.
pub async fn connect_once(path: &Path) -> io::Result<PipeStream> {
    #[cfg(unix)]
    {
        tokio::net::UnixStream::connect(path).await
    }
    #[cfg(windows)]
    {
        tokio::net::windows::named_pipe::ClientOptions::new().open(path)
    }
}

fn is_retryable(error: &io::Error) -> bool {
    const ERROR_PIPE_BUSY: i32 = 231;

    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) || (cfg!(windows) && error.raw_os_error() == Some(ERROR_PIPE_BUSY))
}

/// Connects to `path`, retrying while the endpoint does not exist yet.
///
/// `check_alive` runs before each attempt; its error aborts the loop, which is
/// how an early process exit surfaces instead of a connect timeout.
pub async fn connect_with_backoff<F>(
    path: &Path,
    config: &ConnectConfig,
    mut check_alive: F,
) -> Result<PipeStream, StartupError>
where
    F: FnMut() -> Result<(), StartupError>,
{
    let mut attempt = 0;
    loop {
        check_alive()?;

        match connect_once(path).await {
            Ok(stream) => {
                debug!(path = %path.display(), attempts = attempt + 1, "pipe connected");
                return Ok(stream);
            }
            Err(e) if is_retryable(&e) && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for(attempt);
                trace!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "pipe not ready, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(StartupError::PipeConnect {
                    path: path.display().to_string(),
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
}
