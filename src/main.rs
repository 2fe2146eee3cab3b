mod relay;
mod common;

use relay::config::Config;
use relay::config::load_config;
use common::cli_args::CliArgs;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::FmtSubscriber;
use crate::relay::server::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args: CliArgs = CliArgs::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli_args.log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    tracing::info!("Starting multi-venue order book relay");

    let relay_config: Config = load_config(&cli_args.config)?;
    let relay_server: RelayServer = RelayServer::new(relay_config);

    relay_server.start().await?;

    Ok(())
}
