use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lg_gateway::bootstrap;
use lg_gateway::cli::{Cli, Command, ConfigCommand};
use lg_runtime::mock::MockRuntime;
use lg_runtime::InferenceRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let (config, path) = lg_gateway::cli::load_config(cli.config.as_deref())?;
            init_tracing(config.server.log_level.as_deref());
            tracing::info!(config = %path.display(), "llamagate starting");

            // Real backends plug in through `bootstrap::serve`; the
            // built-in mock backend keeps the server bootable without
            // weights and echoes the last user message.
            let runtime: Arc<dyn InferenceRuntime> = Arc::new(MockRuntime::new());
            tracing::warn!(
                "serving with the built-in mock backend; wire a real inference \
                 runtime via lg_gateway::bootstrap::serve"
            );
            bootstrap::serve(config, runtime).await
        }
        Some(Command::Config { command }) => {
            let (config, path) = lg_gateway::cli::load_config(cli.config.as_deref())?;
            match command {
                ConfigCommand::Validate => {
                    let issues = config.validate();
                    if issues.is_empty() {
                        println!("{}: ok", path.display());
                        return Ok(());
                    }
                    for issue in &issues {
                        println!("{:?}: {}", issue.severity, issue.message);
                    }
                    if issues
                        .iter()
                        .any(|i| i.severity == lg_domain::config::ConfigSeverity::Error)
                    {
                        std::process::exit(1);
                    }
                    Ok(())
                }
                ConfigCommand::Show => {
                    println!("{}", toml::to_string_pretty(&config)?);
                    Ok(())
                }
            }
        }
        Some(Command::Version) => {
            println!("llamagate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the server process. `RUST_LOG` wins over
/// the configured level.
fn init_tracing(configured: Option<&str>) {
    let fallback = configured.unwrap_or("info,lg_gateway=debug");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .json()
        .init();
}
