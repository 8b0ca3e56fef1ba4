//! Protocol client for a build-configuration server process.
//!
//! The client spawns the backend in server mode, connects to its pipe,
//! negotiates the handshake and then correlates requests with replies by
//! cookie. Progress, messages and signals are delivered through
//! [`ClientHooks`].
//!
//! This crate also provides the `cmserver` command-line interface.

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod correlator;
mod dispatch;
pub mod error;
pub mod generator;
pub mod handshake;
pub mod hooks;
pub mod pipe;
pub mod state;
pub mod supervisor;

pub use cli::Cli;
pub use client::{ClientParams, DEFAULT_EXIT_WAIT, ProtocolClient};
pub use config::ClientConfig;
pub use correlator::RequestCorrelator;
pub use error::{ClientError, ClientResult, DrainReason, StartupError};
pub use generator::{fixed_selector, preferred_generator_selector};
pub use handshake::{GeneratorChoice, GeneratorFuture, GeneratorSelector, HandshakeNegotiator};
pub use hooks::{ClientHooks, ProgressUpdate};
pub use pipe::ConnectConfig;
pub use state::ServerState;
pub use supervisor::{ExitInfo, LaunchSpec, OutputSource, ProcessSupervisor, SupervisorEvent};
