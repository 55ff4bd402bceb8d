// Hybrid Grid Bot - Operator CLI
// Single entry point for configuration, preflight, paper runs and status

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use hybrid_grid_bot::{Config, ConfigError};

// Load command modules from cli directory
#[path = "../cli/run_commands.rs"]
mod run_commands;
#[path = "../cli/status_commands.rs"]
mod status_commands;

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version = "0.3.0")]
#[command(about = "Regime-adaptive multi-instance grid trading engine", long_about = None)]
#[command(author = "Grid Trading Team")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration and state directory
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Check the configuration and the symbol partition
    Validate,

    /// Run every instance against the paper exchange
    Run {
        /// Stop after this many minutes (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        minutes: Option<f64>,
    },

    /// Show persisted instance state
    Status {
        /// Include open orders and pending follow-ups
        #[arg(short, long)]
        detailed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging first (before config load so we can see config errors)
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Hybrid Grid Bot v0.3.0");
    info!("📁 Config: {}", cli.config);

    match cli.command {
        // Init doesn't require config (it creates it)
        Commands::Init { force } => {
            init_workspace(force, &cli.config)?;
        }

        Commands::Validate => {
            let config = load_config_or_exit(&cli.config);
            run_commands::validate(&config)?;
        }

        Commands::Run { minutes } => {
            let config = load_config_or_exit(&cli.config);
            if let Err(e) = run_commands::run(config, minutes).await {
                error!("❌ {}", e.user_message());
                std::process::exit(1);
            }
        }

        // Status reads state files only, the exchange is never contacted
        Commands::Status { detailed } => {
            let config = load_config_or_exit(&cli.config);
            status_commands::show_status(&config, detailed)?;
        }
    }

    Ok(())
}

/// Load config or exit with helpful error message
fn load_config_or_exit(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuration Error");
            error!("{}", e);

            if matches!(e, ConfigError::FileRead(_)) {
                error!("");
                error!("💡 Quick fix:");
                error!("   1. Run: grid-bot init");
                error!("   2. Edit {} (instances, capital, symbols)", path);
                error!("   3. Try again");
            }

            std::process::exit(1);
        }
    }
}

fn init_workspace(force: bool, config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    use std::fs;

    info!("🔧 Initializing workspace...");

    if std::path::Path::new(config_path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", config_path);
    } else {
        let example = include_str!("../../config.toml.example");
        fs::write(config_path, example)?;
        info!("📝 Created {}", config_path);
    }

    let config = Config::from_file(config_path)?;
    fs::create_dir_all(&config.orchestrator.state_dir)?;
    info!("📂 State directory: {}", config.orchestrator.state_dir);

    info!("✅ Workspace initialized successfully!");
    info!("💡 Next steps:");
    info!("   1. Edit {} with your instances", config_path);
    info!("   2. Run: grid-bot validate");
    info!("   3. Run: grid-bot run --minutes 30");

    Ok(())
}
