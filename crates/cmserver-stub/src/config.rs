//! Stub backend configuration.
//!
//! The stub is launched exactly like the real backend
//! (`-E server --experimental --pipe=<path>`). Faults are scripted through
//! `CMSERVER_STUB_*` environment variables so that a client can inject them
//! through its ordinary environment overrides.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{StubError, StubResult};

/// Exit code used when crashing on a scripted request.
pub const DEFAULT_CRASH_CODE: u8 = 3;

/// Command line of the stub backend.
#[derive(Debug, Parser)]
#[command(name = "cmserver-stub")]
#[command(author, version, about = "Scriptable stand-in backend", long_about = None)]
pub struct StubArgs {
    /// Tool mode, must be `server`
    #[arg(short = 'E', value_name = "MODE")]
    pub mode: Option<String>,

    /// Accepted for compatibility, always on
    #[arg(long)]
    pub experimental: bool,

    /// Pipe to listen on
    #[arg(long, value_name = "PATH")]
    pub pipe: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Exit without answering when a request of this type arrives
    #[arg(long, env = "CMSERVER_STUB_CRASH_ON", value_delimiter = ',')]
    pub crash_on: Vec<String>,

    /// Exit code used by `--crash-on`
    #[arg(long, env = "CMSERVER_STUB_CRASH_CODE", default_value_t = DEFAULT_CRASH_CODE)]
    pub crash_code: u8,

    /// Stop reading this long before a `--crash-on` exit
    #[arg(long, env = "CMSERVER_STUB_CRASH_DELAY_MS", default_value_t = 0)]
    pub crash_delay_ms: u64,

    /// Close the pipe but keep running when a request of this type arrives
    #[arg(long, env = "CMSERVER_STUB_HANGUP_ON", value_delimiter = ',')]
    pub hangup_on: Vec<String>,

    /// Answer requests of this type with a frame that is not JSON
    #[arg(long, env = "CMSERVER_STUB_GARBAGE_ON", value_delimiter = ',')]
    pub garbage_on: Vec<String>,

    /// Answer requests of this type with a frame that never closes
    #[arg(long, env = "CMSERVER_STUB_FLOOD_ON", value_delimiter = ',')]
    pub flood_on: Vec<String>,

    /// Never answer requests of this type
    #[arg(long, env = "CMSERVER_STUB_SILENT_ON", value_delimiter = ',')]
    pub silent_on: Vec<String>,

    /// Answer the handshake with an error
    #[arg(long, env = "CMSERVER_STUB_REJECT_HANDSHAKE")]
    pub reject_handshake: bool,

    /// Text printed to stdout and stderr, and as unframed noise on the pipe
    #[arg(long, env = "CMSERVER_STUB_STRAY_OUTPUT")]
    pub stray_output: Option<String>,

    /// Send a `dirty` signal after every compute
    #[arg(long, env = "CMSERVER_STUB_SIGNAL_DIRTY")]
    pub signal_dirty: bool,

    /// Wait this long before creating the pipe
    #[arg(long, env = "CMSERVER_STUB_LISTEN_DELAY_MS", default_value_t = 0)]
    pub listen_delay_ms: u64,

    /// Print an error and exit with this code instead of listening
    #[arg(long, env = "CMSERVER_STUB_FAIL_BEFORE_LISTEN")]
    pub fail_before_listen: Option<u8>,
}

impl StubArgs {
    /// Validates the server-mode arguments and builds the runtime config.
    pub fn into_config(self) -> StubResult<StubConfig> {
        match self.mode.as_deref() {
            Some("server") => {}
            Some(other) => {
                return Err(StubError::config(format!(
                    "unsupported mode \"{}\", only \"server\" is available",
                    other
                )));
            }
            None => return Err(StubError::config("missing -E server")),
        }
        let pipe = self
            .pipe
            .ok_or_else(|| StubError::config("missing --pipe=<path>"))?;

        let mut config = StubConfig::new(pipe)
            .with_crash_on(self.crash_on)
            .with_crash_code(self.crash_code)
            .with_crash_delay(Duration::from_millis(self.crash_delay_ms))
            .with_hangup_on(self.hangup_on)
            .with_garbage_on(self.garbage_on)
            .with_flood_on(self.flood_on)
            .with_silent_on(self.silent_on)
            .with_reject_handshake(self.reject_handshake)
            .with_signal_dirty(self.signal_dirty)
            .with_listen_delay(Duration::from_millis(self.listen_delay_ms));
        if let Some(text) = self.stray_output {
            config = config.with_stray_output(text);
        }
        config.fail_before_listen = self.fail_before_listen;
        Ok(config)
    }
}

/// Runtime configuration of the stub backend.
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Path of the pipe to listen on.
    pub pipe_path: PathBuf,

    /// Request types that make the process exit.
    pub crash_on: BTreeSet<String>,

    pub crash_code: u8,

    /// Time spent idle, without reading, before a scripted crash.
    pub crash_delay: Duration,

    /// Request types that make the stub close the pipe and linger.
    pub hangup_on: BTreeSet<String>,

    /// Request types answered with a malformed frame.
    pub garbage_on: BTreeSet<String>,

    /// Request types answered with an unterminated frame.
    pub flood_on: BTreeSet<String>,

    /// Request types that are read but never answered.
    pub silent_on: BTreeSet<String>,

    pub reject_handshake: bool,

    pub stray_output: Option<String>,

    pub signal_dirty: bool,

    /// Delay before the pipe is created.
    pub listen_delay: Duration,

    pub fail_before_listen: Option<u8>,
}

impl StubConfig {
    /// Creates a well-behaved configuration listening on `pipe_path`.
    pub fn new(pipe_path: impl Into<PathBuf>) -> Self {
        Self {
            pipe_path: pipe_path.into(),
            crash_on: BTreeSet::new(),
            crash_code: DEFAULT_CRASH_CODE,
            crash_delay: Duration::ZERO,
            hangup_on: BTreeSet::new(),
            garbage_on: BTreeSet::new(),
            flood_on: BTreeSet::new(),
            silent_on: BTreeSet::new(),
            reject_handshake: false,
            stray_output: None,
            signal_dirty: false,
            listen_delay: Duration::ZERO,
            fail_before_listen: None,
        }
    }

    /// Builder: set request types to crash on.
    pub fn with_crash_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.crash_on = normalize(kinds);
        self
    }

    /// Builder: set crash exit code.
    pub fn with_crash_code(mut self, code: u8) -> Self {
        self.crash_code = code;
        self
    }

    /// Builder: set crash delay.
    pub fn with_crash_delay(mut self, delay: Duration) -> Self {
        self.crash_delay = delay;
        self
    }

    /// Builder: set request types to hang up on.
    pub fn with_hangup_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hangup_on = normalize(kinds);
        self
    }

    /// Builder: set request types answered with a malformed frame.
    pub fn with_garbage_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.garbage_on = normalize(kinds);
        self
    }

    /// Builder: set request types answered with an unterminated frame.
    pub fn with_flood_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flood_on = normalize(kinds);
        self
    }

    /// Builder: set request types to ignore.
    pub fn with_silent_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.silent_on = normalize(kinds);
        self
    }

    /// Builder: set handshake rejection.
    pub fn with_reject_handshake(mut self, reject: bool) -> Self {
        self.reject_handshake = reject;
        self
    }

    /// Builder: set stray output text.
    pub fn with_stray_output(mut self, text: impl Into<String>) -> Self {
        self.stray_output = Some(text.into());
        self
    }

    /// Builder: set dirty signalling.
    pub fn with_signal_dirty(mut self, on: bool) -> Self {
        self.signal_dirty = on;
        self
    }

    /// Builder: set listen delay.
    pub fn with_listen_delay(mut self, delay: Duration) -> Self {
        self.listen_delay = delay;
        self
    }

    pub fn crashes_on(&self, kind: &str) -> bool {
        self.crash_on.contains(kind)
    }

    pub fn hangs_up_on(&self, kind: &str) -> bool {
        self.hangup_on.contains(kind)
    }

    pub fn sends_garbage_on(&self, kind: &str) -> bool {
        self.garbage_on.contains(kind)
    }

    pub fn floods_on(&self, kind: &str) -> bool {
        self.flood_on.contains(kind)
    }

    pub fn is_silent_on(&self, kind: &str) -> bool {
        self.silent_on.contains(kind)
    }
}

fn normalize<I, S>(kinds: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    kinds
        .into_iter()
        .map(Into::into)
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}
