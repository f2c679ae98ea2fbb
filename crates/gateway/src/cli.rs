use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use lg_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "llamagate", about = "Local inference gateway for on-disk LLM weights")]
pub struct Cli {
    /// Path to the configuration file (default: ./llamagate.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway (default when no subcommand is given).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version and exit.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Check the configuration and report problems.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the configuration file. An explicitly passed path must exist; the
/// default path falls back to an empty configuration when absent.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let default = PathBuf::from("llamagate.toml");
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default, false),
    };

    if !path.exists() {
        if explicit {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok((config, path))
}
