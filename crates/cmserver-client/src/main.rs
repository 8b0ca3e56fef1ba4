//! cmserver CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use cmserver_client::cli::{Cli, Command, ConfigAction};
use cmserver_client::commands;
use cmserver_client::config::ClientConfig;
use cmserver_client::error::ClientResult;
use cmserver_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing_config = if cli.debug {
        TracingConfig::cli_debug()
    } else {
        TracingConfig::cli()
    };
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("warning: could not initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config_path = cli.config_path();
    let config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };

    if cli.command.needs_backend() {
        return commands::session::run(&cli, &config).await;
    }

    match cli.command {
        Command::Config { ref action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, &config_path),
            ConfigAction::Path => commands::config::path(&config_path),
        },
        _ => Ok(()),
    }
}
