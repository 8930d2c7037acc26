//! fabctl - command-line client for the Fat-Tree fabric controller
//!
//! Reads scheduler state, placement and slice tables, installed routes and
//! health from the controller HTTP API.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{fabric, snapshot};

/// Fat-Tree fabric controller CLI
#[derive(Parser)]
#[command(name = "fabctl")]
#[command(author, version, about = "CLI for the Fat-Tree fabric controller", long_about = None)]
pub struct Cli {
    /// Controller API URL (can also be set via FABCTL_API_URL env var)
    #[arg(long, env = "FABCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show flows inferred on the core switches
    Flows,

    /// Show congested core downlinks
    Congestions,

    /// Show port counters
    Ports {
        /// Only this switch, e.g. c11 or p0_s2
        #[arg(long, short)]
        switch: Option<String>,
    },

    /// Show the service placement table
    Placements,

    /// Show slice membership
    Slices,

    /// Show routes installed through the southbound channel
    Routes {
        /// Only rules for this 16-bit dpid
        #[arg(long)]
        dpid: Option<u16>,
    },

    /// Show controller health
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let api_url = config::Config::load()?.resolve_api_url(cli.api_url);
    if cli.verbose {
        output::print_info(&format!("Using controller at {}", api_url));
    }

    let client = client::ApiClient::new(&api_url)?;

    match cli.command {
        Commands::Flows => snapshot::show_flows(&client, cli.format).await?,
        Commands::Congestions => snapshot::show_congestions(&client, cli.format).await?,
        Commands::Ports { switch } => snapshot::show_ports(&client, switch, cli.format).await?,
        Commands::Placements => fabric::show_placements(&client, cli.format).await?,
        Commands::Slices => fabric::show_slices(&client, cli.format).await?,
        Commands::Routes { dpid } => fabric::show_routes(&client, dpid, cli.format).await?,
        Commands::Health => fabric::show_health(&client, cli.format).await?,
    }

    Ok(())
}
