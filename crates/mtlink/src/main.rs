mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// mtlink - session and connection manager for encrypted mobile transports
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and print a summary
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "mtlink.yaml", env = "MTLINK_CONFIG")]
        config: String,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show which phone numbers have a persisted session
    Status {
        /// Phone number to check (omit to list every persisted session)
        #[arg(long)]
        phone: Option<String>,

        /// Path to configuration file
        #[arg(short, long, default_value = "mtlink.yaml", env = "MTLINK_CONFIG")]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config, format } => commands::check::run(&config, &format).await,
        Commands::Status { phone, config } => {
            commands::status::run(&config, phone.as_deref()).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
