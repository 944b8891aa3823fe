//! Cadence CLI, the main entry point.
//!
//! Commands:
//! - `run`     Run simulated sessions until stopped
//! - `estop`   Engage or release the emergency stop marker
//! - `config`  Validate, show or locate the configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod sim;

#[derive(Parser)]
#[command(
    name = "cadence",
    about = "Cadence: concurrent perception-decision-action control loop runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (default: ~/.cadence/config.toml)
    #[arg(short, long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated sessions until Ctrl-C, an estop, or the cycle limit
    Run {
        /// Number of generated sessions when none are configured
        #[arg(short, long)]
        sessions: Option<u32>,

        /// Cycles per session before it finishes on its own
        #[arg(long)]
        cycles: Option<u64>,

        /// Stop every session after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Seed for reproducible delays and simulated failures
        #[arg(long)]
        seed: Option<u64>,

        /// Use fixed midpoint delays instead of randomized ones
        #[arg(long)]
        no_jitter: bool,
    },

    /// Engage the emergency stop for every running session
    Estop {
        /// Release the emergency stop
        #[arg(long)]
        resume: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Check the configuration for errors
    Validate,
    /// Print the effective configuration
    Show,
    /// Print the default config file path
    Path,
    /// Print a config file with every default filled in
    Defaults,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            sessions,
            cycles,
            duration,
            seed,
            no_jitter,
        } => {
            let options = commands::run::RunOptions {
                sessions,
                cycles,
                duration,
                seed,
                no_jitter,
            };
            commands::run::run(config, options).await?
        }
        Commands::Estop { resume } => commands::estop::run(resume).await?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate(config).await?,
            ConfigAction::Show => commands::config_cmd::show(config).await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Defaults => commands::config_cmd::defaults().await?,
        },
    }

    Ok(())
}
