//! Commands that run a backend session.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use cmserver_protocol::{CacheContent, CacheEntry};

use crate::cli::{Cli, Command, cache_arguments};
use crate::client::{ClientParams, ProtocolClient};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::generator::{fixed_selector, preferred_generator_selector};
use crate::hooks::ClientHooks;
use crate::supervisor::OutputSource;

/// Starts a backend, runs the subcommand and shuts the backend down.
pub async fn run(cli: &Cli, config: &ClientConfig) -> ClientResult<()> {
    let params = session_params(cli, config)?;
    let client = ProtocolClient::start(params).await?;

    let result = execute(&client, &cli.command).await;
    let exit = client.shutdown().await?;
    debug!(exit = ?exit, "session finished");
    result
}

fn absolute(path: &Path) -> ClientResult<String> {
    let path = std::path::absolute(path)?;
    Ok(path.to_string_lossy().into_owned())
}

fn session_params(cli: &Cli, config: &ClientConfig) -> ClientResult<ClientParams> {
    let source_dir = absolute(&cli.source)?;
    let build_dir = absolute(&cli.build)?;
    std::fs::create_dir_all(&build_dir)?;

    let selector = match &cli.generator {
        Some(name) => fixed_selector(Some(config.generator.choice(name.clone()))),
        None => preferred_generator_selector(config.generator.clone()),
    };

    let hooks = ClientHooks::new()
        .on_progress(|p| {
            if p.maximum > p.minimum {
                eprintln!(
                    "[{:>3}%] {}",
                    (p.current - p.minimum) * 100 / (p.maximum - p.minimum),
                    p.message
                );
            }
        })
        .on_message(|text, title| match title {
            Some(title) => eprintln!("{}: {}", title, text),
            None => eprintln!("{}", text),
        })
        .on_dirty(|| eprintln!("configuration is out of date"))
        .on_crash(|code, signal| {
            eprintln!("backend crashed (code: {:?}, signal: {:?})", code, signal)
        })
        .on_other_output(|source, line| {
            if source == OutputSource::Stderr {
                eprintln!("{}", line);
            }
        });

    Ok(ClientParams::new(
        config.launch_spec(cli.cmake.as_deref()),
        source_dir,
        build_dir,
        selector,
    )
    .with_hooks(hooks)
    .with_max_buffer_size(config.server.max_buffer_size)
    .with_exit_wait(config.server.exit_wait()))
}

async fn execute(client: &ProtocolClient, command: &Command) -> ClientResult<()> {
    match command {
        Command::Configure { define, compute } => {
            client.configure(cache_arguments(define)).await?;
            if *compute {
                client.compute().await?;
            }
            Ok(())
        }
        Command::Compute => {
            client.configure(Vec::new()).await?;
            client.compute().await
        }
        Command::Codemodel => {
            client.configure(Vec::new()).await?;
            client.compute().await?;
            print_json(&client.codemodel().await?)
        }
        Command::Cache { key } => {
            client.configure(Vec::new()).await?;
            let cache = client.get_cache().await?;
            match key {
                Some(key) => print_json(cache_entry(&cache, key)?),
                None => print_json(&cache),
            }
        }
        Command::Settings => print_json(&client.get_global_settings().await?),
        Command::Inputs => {
            client.configure(Vec::new()).await?;
            print_json(&client.cmake_inputs().await?)
        }
        Command::Config { .. } => Ok(()),
    }
}

fn cache_entry<'a>(cache: &'a CacheContent, key: &str) -> ClientResult<&'a CacheEntry> {
    cache
        .get(key)
        .ok_or_else(|| ClientError::Command(format!("no cache entry named {key}")))
}

fn print_json<T: Serialize>(value: &T) -> ClientResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ClientError::Command(format!("failed to render reply: {}", e)))?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CacheContent {
        CacheContent {
            cache: vec![CacheEntry {
                key: "CMAKE_GENERATOR".into(),
                value: "Ninja".into(),
                entry_type: "INTERNAL".into(),
                properties: Default::default(),
            }],
        }
    }

    #[test]
    fn cache_entry_is_found_by_key() {
        let cache = cache();
        let entry = cache_entry(&cache, "CMAKE_GENERATOR").unwrap();
        assert_eq!(entry.value, "Ninja");
    }

    #[test]
    fn missing_cache_entry_is_a_command_error() {
        let err = cache_entry(&cache(), "CMAKE_BUILD_TYPE").unwrap_err();
        assert!(matches!(err, ClientError::Command(_)));
        assert_eq!(
            err.to_string(),
            "command failed: no cache entry named CMAKE_BUILD_TYPE"
        );
    }
}
