// mpp-sim: offline simulator for multi-part payments
// Loads a scenario network and either previews a split or runs a full send against it

use anyhow::Result;
use clap::{Parser, Subcommand};
use mpp_cli::commands::{self, print_error};
use mpp_cli::config::{load_mpp_config, OutputFormat};
use mpp_cli::scenario::Scenario;
use mpp_core::lightning::SplitStrategy;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mpp-sim")]
#[command(about = "Multi-part payment simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// MPP configuration file (TOML); defaults are used when omitted
    #[arg(short, long, global = true, env = "MPP_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how an amount would be split over the sender's channels
    Split {
        #[arg(short, long, value_name = "FILE")]
        scenario: PathBuf,

        /// Amount in millisatoshis
        #[arg(short, long)]
        amount: u64,

        /// equal, liquidity_based, success_rate_based, hybrid or adaptive
        #[arg(long)]
        strategy: Option<SplitStrategy>,

        #[arg(long)]
        json: bool,
    },

    /// Send a payment through the simulated network
    Send {
        #[arg(short, long, value_name = "FILE")]
        scenario: PathBuf,

        /// Amount in millisatoshis
        #[arg(short, long)]
        amount: u64,

        #[arg(long)]
        strategy: Option<SplitStrategy>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_mpp_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Split {
            scenario,
            amount,
            strategy,
            json,
        } => {
            let scenario = Scenario::load(&scenario)?;
            let format = OutputFormat::from_flag(json);
            commands::split::run(&config, &scenario, amount, strategy, &format)
        }
        Commands::Send {
            scenario,
            amount,
            strategy,
            json,
        } => {
            let scenario = Scenario::load(&scenario)?;
            let format = OutputFormat::from_flag(json);
            commands::send::run(config, &scenario, amount, strategy, &format).await
        }
    }
}
