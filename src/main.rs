use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;

mod app;
mod cli;

use app::discovery::DiscoveryClient;
use app::orchestrator::Orchestrator;
use app::stats::StatsStore;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::CliArgs::parse();
    tracing_subscriber::registry()
        .with(args.log_level)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.resolve().context("failed to load config file")?;

    let discovery_request_timeout_sec = config.discovery.request_timeout_sec;
    let discovery_request_retries = config.discovery.request_retries;

    let discovery = DiscoveryClient::new(config.discovery)
        .context("failed to build discovery client")?;
    let stats = StatsStore::new(config.stats).context("invalid stats config")?;

    let orchestrator = Orchestrator::new(
        discovery,
        config.probe,
        stats,
        config.orchestrator,
        discovery_request_timeout_sec,
        discovery_request_retries,
    );

    orchestrator.run_forever().await
}
