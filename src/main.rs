mod auth;
mod cli;
mod config;
mod context;
mod csrf;
mod livekit;
mod logging;
mod server;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::DashboardConfig;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(1000);

    let cli = Cli::parse();
    let config = DashboardConfig::from_env().context("failed to load dashboard configuration")?;
    cli::run(cli, config).await
}
