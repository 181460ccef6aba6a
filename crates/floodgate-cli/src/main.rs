//! Floodgate CLI - resilience gateway in front of a document store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use floodgate_core::config::{LogFormat, MonitoringConfig};
use floodgate_core::{Config, Error as CoreError, StoreError};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (unreadable file, bad TOML, failed validation)
    ConfigError = 1,
    /// Document store error
    StoreError = 2,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code, by type where possible and by message
    /// otherwise.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(core) = error.downcast_ref::<CoreError>() {
            return match core {
                CoreError::Config(_) | CoreError::Serialization(_) => ExitCode::ConfigError,
                CoreError::Store(_) => ExitCode::StoreError,
                CoreError::Shutdown => ExitCode::SignalInterrupt,
                CoreError::Io(_) => ExitCode::RuntimeError,
            };
        }
        if error.downcast_ref::<StoreError>().is_some() {
            return ExitCode::StoreError;
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("store") {
            ExitCode::StoreError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "floodgate")]
#[command(about = "Rate limiting, caching and write batching in front of a document store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "FLOODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show health and metrics of a running gateway
    Status {
        /// Gateway base URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config file when it parses; a broken
    // file is reported later by the command itself.
    let monitoring = cli
        .config
        .as_deref()
        .and_then(|path| Config::from_file(path).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();
    init_logging(&monitoring, cli.verbose);

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

fn init_logging(monitoring: &MonitoringConfig, verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }
}

async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { port } => {
            let config = load_config(cli.config.as_deref())?;
            commands::serve::run(config, port).await?;
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

/// Load the config file, or defaults when none was given.
fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => {
            tracing::info!("No config file given, using defaults");
            Ok(Config::default())
        }
    }
}
