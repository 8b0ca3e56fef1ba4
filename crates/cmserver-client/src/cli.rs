//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ClientConfig;

/// cmserver - drive a build-configuration server from the command line
#[derive(Debug, Parser)]
#[command(name = "cmserver")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "CMSERVER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Backend executable (overrides the configuration)
    #[arg(long, env = "CMSERVER_CMAKE", global = true)]
    pub cmake: Option<PathBuf>,

    /// Source directory
    #[arg(long, short = 'S', default_value = ".", global = true)]
    pub source: PathBuf,

    /// Build directory
    #[arg(long, short = 'B', default_value = "build", global = true)]
    pub build: PathBuf,

    /// Generator for a build directory without a cache
    #[arg(long, short = 'G', global = true)]
    pub generator: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure the build directory
    Configure {
        /// Cache entry to set, as VAR=VALUE or VAR:TYPE=VALUE (can be repeated)
        #[arg(short = 'D', value_name = "VAR=VALUE", action = clap::ArgAction::Append)]
        define: Vec<String>,

        /// Generate the build system after configuring
        #[arg(long)]
        compute: bool,
    },

    /// Configure and generate the build system
    Compute,

    /// Print the code model (targets, sources, flags)
    Codemodel,

    /// Print cache entries
    Cache {
        /// Only print this entry
        key: Option<String>,
    },

    /// Print global settings
    Settings,

    /// Print the files the configuration depends on
    Inputs,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Show configuration file path
    Path,
}

impl Cli {
    /// Configuration file in effect: `--config` when given, the default path
    /// otherwise.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(ClientConfig::default_path)
    }
}

impl Command {
    /// Returns true for commands that need a running backend.
    pub fn needs_backend(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }
}

/// Turns `-D` values into backend cache arguments.
pub fn cache_arguments(defines: &[String]) -> Vec<String> {
    defines.iter().map(|d| format!("-D{d}")).collect()
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_configure_with_defines() {
        let cli = Cli::try_parse_from([
            "cmserver",
            "-S",
            "/src",
            "-B",
            "/src/build",
            "configure",
            "-D",
            "CMAKE_BUILD_TYPE=Debug",
            "-DFOO:BOOL=ON",
            "--compute",
        ])
        .unwrap();

        assert_eq!(cli.source, PathBuf::from("/src"));
        assert_eq!(cli.build, PathBuf::from("/src/build"));
        match cli.command {
            Command::Configure { define, compute } => {
                assert_eq!(define, vec!["CMAKE_BUILD_TYPE=Debug", "FOO:BOOL=ON"]);
                assert!(compute);
                assert_eq!(
                    cache_arguments(&define),
                    vec!["-DCMAKE_BUILD_TYPE=Debug", "-DFOO:BOOL=ON"]
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cmserver", "cache", "CMAKE_GENERATOR", "-G", "Ninja"])
            .unwrap();
        assert_eq!(cli.generator.as_deref(), Some("Ninja"));
        assert!(matches!(cli.command, Command::Cache { key: Some(ref k) } if k == "CMAKE_GENERATOR"));
        assert!(cli.command.needs_backend());
    }

    #[test]
    fn config_commands_need_no_backend() {
        let cli = Cli::try_parse_from(["cmserver", "config", "path"]).unwrap();
        assert!(!cli.command.needs_backend());
    }

    #[test]
    fn config_path_follows_the_flag() {
        let cli =
            Cli::try_parse_from(["cmserver", "--config", "/etc/cmserver.toml", "config", "dump"])
                .unwrap();
        assert_eq!(cli.config_path(), PathBuf::from("/etc/cmserver.toml"));

        let cli = Cli::try_parse_from(["cmserver", "config", "path"]).unwrap();
        if cli.config.is_none() {
            assert_eq!(cli.config_path(), ClientConfig::default_path());
        }
    }
}
