mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabpilot")]
#[command(about = "LLM-guided browser automation over the Chrome DevTools Protocol", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize tabpilot configuration
    Onboard {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and session-record status
    Status,

    /// Run one automation session for a goal
    Run {
        /// Natural-language goal for the session
        #[arg(short, long)]
        goal: String,

        /// Open this URL in a fresh tab and drive it
        #[arg(short, long)]
        url: Option<String>,

        /// Drive an existing tab by handle (see `tabpilot status`)
        #[arg(short, long)]
        tab: Option<u32>,

        /// Step limit for this session (default from config)
        #[arg(long)]
        max_steps: Option<u32>,
    },

    /// Stay connected and serve server-initiated sessions
    Listen,

    /// Run environment diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(force).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Run {
            goal,
            url,
            tab,
            max_steps,
        } => {
            commands::run::run(goal, url, tab, max_steps).await?;
        }
        Commands::Listen => {
            commands::listen::run().await?;
        }
        Commands::Doctor => {
            commands::doctor::run().await?;
        }
    }

    Ok(())
}
