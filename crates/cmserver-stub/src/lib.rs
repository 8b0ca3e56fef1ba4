//! Scriptable stand-in for the build-configuration backend.
//!
//! The stub listens on the pipe it is given, greets the client, and answers
//! requests with canned but self-consistent replies. Faults such as crashing
//! on a request type or never answering one are selected through
//! [`StubConfig`] so end-to-end tests can drive every client code path.
//!
//! # Example
//!
//! ```rust,no_run
//! use cmserver_stub::{StubConfig, run};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StubConfig::new("/tmp/cmake-server-demo").with_signal_dirty(true);
//!     let code = run(config).await?;
//!     std::process::exit(code.into());
//! }
//! ```

mod config;
mod error;
mod handler;
#[cfg(unix)]
mod socket;

pub use config::{DEFAULT_CRASH_CODE, StubArgs, StubConfig};
pub use error::{StubError, StubResult};
pub use handler::{Action, StubBackend};
#[cfg(unix)]
pub use socket::{Connection, Incoming, PipeListener};

#[cfg(unix)]
use std::time::Duration;

#[cfg(unix)]
use tracing::{debug, info, warn};

/// How long a stub that hung up stays alive without its pipe.
#[cfg(unix)]
const HANGUP_LINGER: Duration = Duration::from_secs(30);

/// Serves one client and returns the process exit code.
///
/// Returns 0 once the client closes the pipe, or the scripted crash code.
/// After a scripted hangup the process lingers without its pipe until it is
/// killed.
#[cfg(unix)]
pub async fn run(config: StubConfig) -> StubResult<u8> {
    if let Some(code) = config.fail_before_listen {
        eprintln!("CMake Error: stub backend told to fail before listening");
        return Ok(code);
    }
    if let Some(text) = &config.stray_output {
        println!("{}", text);
        eprintln!("{}", text);
    }
    if !config.listen_delay.is_zero() {
        debug!(delay_ms = config.listen_delay.as_millis(), "Delaying listen");
        tokio::time::sleep(config.listen_delay).await;
    }

    let listener = PipeListener::bind(&config.pipe_path).await?;
    let mut conn = listener.accept().await?;
    let stray = config.stray_output.clone();
    let mut backend = StubBackend::new(config);

    if let Some(text) = stray {
        conn.send_raw(format!("{}\n", text).as_bytes()).await?;
    }
    conn.send(&backend.hello()?).await?;

    loop {
        let Some(incoming) = conn.read_request().await? else {
            info!(handshaken = backend.is_handshaken(), "Client closed the pipe");
            return Ok(0);
        };
        match backend.handle(incoming)? {
            Action::Send(messages) => {
                for message in &messages {
                    conn.send(message).await?;
                }
            }
            Action::Raw(bytes) => conn.send_raw(&bytes).await?,
            Action::Silent => {}
            Action::Hangup => {
                drop(conn);
                info!(linger_s = HANGUP_LINGER.as_secs(), "Pipe closed, lingering");
                tokio::time::sleep(HANGUP_LINGER).await;
                return Ok(0);
            }
            Action::Crash(code) => {
                let delay = backend.crash_delay();
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis(), "Idling before crash");
                    tokio::time::sleep(delay).await;
                }
                warn!(code, "Exiting without a reply");
                return Ok(code);
            }
        }
    }
}
