//! Ogent — distributed command-execution control plane.
//!
//! One binary, two processes: `ogent controller` runs the central dispatch
//! service, `ogent agent` runs a command-executing agent that connects to
//! it.

#![forbid(unsafe_code)]

mod agent;
mod api;
mod middleware;
mod server;
mod websocket;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ogent", version, about = "Distributed command-execution control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller (dispatch service)
    Controller,
    /// Run an agent that executes commands
    Agent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ogent=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Controller => {
            info!("starting ogent controller v{}", env!("CARGO_PKG_VERSION"));
            let config =
                server::load_controller_config().context("failed to load controller config")?;
            server::run(config).await
        }
        Command::Agent => {
            info!("starting ogent agent v{}", env!("CARGO_PKG_VERSION"));
            let config = agent::load_agent_config().context("failed to load agent config")?;
            agent::run(config).await
        }
    }
}
