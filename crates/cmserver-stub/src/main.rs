//! cmserver-stub entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, error};

use cmserver_core::{TracingConfig, init_tracing};
use cmserver_stub::StubArgs;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = StubArgs::parse();

    let mut tracing_config = TracingConfig::backend();
    if args.debug {
        tracing_config = tracing_config.with_level(Level::DEBUG);
    }
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("warning: could not initialize logging: {}", e);
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    serve(config).await
}

#[cfg(unix)]
async fn serve(config: cmserver_stub::StubConfig) -> ExitCode {
    match cmserver_stub::run(config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "Stub backend failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(unix))]
async fn serve(_config: cmserver_stub::StubConfig) -> ExitCode {
    error!("the stub backend only supports Unix sockets");
    ExitCode::FAILURE
}
