//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/cmserver/config.toml` by default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cmserver_protocol::DEFAULT_MAX_BUFFER_SIZE;

use crate::client::DEFAULT_EXIT_WAIT;
use crate::error::{ClientError, ClientResult};
use crate::handshake::GeneratorChoice;
use crate::pipe::{ConnectConfig, unique_pipe_path};
use crate::supervisor::LaunchSpec;

/// Configuration for the cmserver client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend executable; `cmake` on `PATH` when unset.
    pub cmake_path: Option<PathBuf>,

    /// Variables layered over the inherited environment.
    pub environment: BTreeMap<String, String>,

    /// Generator preferences for clean build directories.
    pub generator: GeneratorSettings,

    /// Process and pipe settings.
    pub server: ServerSettings,
}

/// Generator preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Tried in order; the first usable one wins.
    pub preferred: Vec<String>,
    pub platform: Option<String>,
    pub toolset: Option<String>,
    pub extra_generator: Option<String>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            preferred: vec!["Ninja".to_string(), "Unix Makefiles".to_string()],
            platform: None,
            toolset: None,
            extra_generator: None,
        }
    }
}

impl GeneratorSettings {
    /// Combines `name` with the configured platform, toolset and extra generator.
    pub fn choice(&self, name: impl Into<String>) -> GeneratorChoice {
        GeneratorChoice {
            name: name.into(),
            platform: self.platform.clone(),
            toolset: self.toolset.clone(),
            extra_generator: self.extra_generator.clone(),
        }
    }
}

/// Process and pipe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Directory for pipe files (unix). System temp directory when unset.
    pub pipe_dir: Option<PathBuf>,

    /// First retry delay while waiting for the pipe, in milliseconds.
    pub connect_initial_delay_ms: u64,

    /// Largest retry delay, in milliseconds.
    pub connect_max_delay_ms: u64,

    /// Connection attempts before giving up.
    pub connect_attempts: u32,

    /// Time the backend gets to exit on shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,

    /// Time to wait for the exit status once the pipe breaks, in milliseconds.
    pub exit_wait_ms: u64,

    /// Bound on buffered, not yet framed bytes.
    pub max_buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let connect = ConnectConfig::default();
        Self {
            pipe_dir: None,
            connect_initial_delay_ms: connect.initial_delay.as_millis() as u64,
            connect_max_delay_ms: connect.max_delay.as_millis() as u64,
            connect_attempts: connect.max_attempts,
            shutdown_grace_ms: 5_000,
            exit_wait_ms: DEFAULT_EXIT_WAIT.as_millis() as u64,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

impl ServerSettings {
    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig::default()
            .with_initial_delay(Duration::from_millis(self.connect_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.connect_max_delay_ms))
            .with_max_attempts(self.connect_attempts)
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }
}

impl ClientConfig {
    /// Loads configuration from the default path, or defaults if absent.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ClientResult<Self> {
        toml::from_str(content)
            .map_err(|e| ClientError::Config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cmserver")
    }

    /// Backend executable, `override_path` first.
    pub fn cmake_program(&self, override_path: Option<&Path>) -> PathBuf {
        override_path
            .map(Path::to_path_buf)
            .or_else(|| self.cmake_path.clone())
            .unwrap_or_else(|| PathBuf::from("cmake"))
    }

    /// Launch spec for a fresh session.
    pub fn launch_spec(&self, override_path: Option<&Path>) -> LaunchSpec {
        LaunchSpec::new(self.cmake_program(override_path))
            .with_pipe_path(unique_pipe_path(self.server.pipe_dir.as_deref()))
            .with_env(self.environment.clone())
            .with_connect(self.server.connect_config())
            .with_shutdown_grace(Duration::from_millis(self.server.shutdown_grace_ms))
    }
}
