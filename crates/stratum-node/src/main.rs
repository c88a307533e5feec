use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stratum_core::{Runtime, RuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt};

mod probe;

#[derive(Parser)]
#[command(name = "stratum", about = "stratum layer runtime: configuration, bridge status and load probe")]
struct Cli {
    /// Path to the config file (default: ~/.stratum/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration as JSON
    Config,
    /// Report whether a distributed transport is connected
    Bridge,
    /// Drive an echo layer from concurrent workers and print its statistics
    Probe {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Invocations per worker
        #[arg(long, default_value_t = 100)]
        calls: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let filter = EnvFilter::from_env("STRATUM_LOG");
    if cli.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Bridge => {
            let runtime = Runtime::builder().config(config).build();
            let bridge = runtime.bridge();
            let status = serde_json::json!({
                "connected": bridge.is_connected(),
                "transport": bridge.transport_name(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Probe { workers, calls } => {
            let runtime = Runtime::builder().config(config).build();
            let report = probe::run(&runtime, workers, calls).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Load configuration. An explicit path must exist; the default location
/// falls back to built-in defaults when absent.
fn load_config(explicit: Option<&Path>) -> Result<RuntimeConfig> {
    let config = match explicit {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => match default_config_path() {
            Some(path) if path.exists() => RuntimeConfig::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            _ => {
                tracing::debug!("No config file found, using defaults");
                RuntimeConfig::default()
            }
        },
    };
    Ok(config.with_env_overrides())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".stratum").join("config.toml"))
}
