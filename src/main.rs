use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use fxchart::core::log::init_logging;
use fxchart::core::{CurrencyPair, Period};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Display the exchange-rate chart for a currency pair
    Chart {
        /// Currency converted from, e.g. USD
        #[arg(short, long)]
        base: String,
        /// Currency converted to, e.g. JPY
        #[arg(short, long)]
        quote: String,
        /// Lookback window: 7d, 30d, 90d or 180d
        #[arg(short, long, default_value = "30d")]
        period: Period,
        /// Print the chart data as JSON
        #[arg(long)]
        json: bool,
    },
    /// List previously viewed currency pairs
    History,
    /// Find currency codes by code or name prefix
    Search { query: String },
    /// Open a browser session with the rate source and save its cookies
    Login,
    /// Refresh stale charts of previously viewed pairs
    Refresh,
    /// Keep previously viewed charts fresh until interrupted
    Watch,
}

impl TryFrom<Commands> for fxchart::AppCommand {
    type Error = anyhow::Error;

    fn try_from(cmd: Commands) -> Result<fxchart::AppCommand> {
        Ok(match cmd {
            Commands::Chart {
                base,
                quote,
                period,
                json,
            } => fxchart::AppCommand::Chart {
                pair: CurrencyPair::new(&base, &quote)?,
                period,
                json,
            },
            Commands::History => fxchart::AppCommand::History,
            Commands::Search { query } => fxchart::AppCommand::Search { query },
            Commands::Login => fxchart::AppCommand::Login,
            Commands::Refresh => fxchart::AppCommand::Refresh,
            Commands::Watch => fxchart::AppCommand::Watch,
            Commands::Setup => anyhow::bail!("Setup command should be handled separately"),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => match cli.config_path.as_deref() {
            Some(path) => fxchart::cli::setup::setup_at_path(path),
            None => fxchart::cli::setup::setup(),
        },
        Some(cmd) => match fxchart::AppCommand::try_from(cmd) {
            Ok(command) => fxchart::run_command(command, cli.config_path.as_deref()).await,
            Err(e) => Err(e),
        },
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
