use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cloudrelay::config::{Cli, Config};
use cloudrelay::observer::{AwsClientFactory, Observer};
use cloudrelay::smtp::SmtpServer;
use cloudrelay::{init_tracing, relay, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_cli(cli).context("invalid configuration")?;

    let relay_client = relay::from_config(&config).await;
    let observer_config = config.observer.clone();

    let shutdown = CancellationToken::new();
    let server = SmtpServer::new(Arc::new(config), relay_client, shutdown.clone());
    let mut server_task = tokio::spawn(server.serve());

    if let Some(observer_config) = observer_config {
        Observer::new(observer_config, Arc::new(AwsClientFactory), shutdown.clone()).spawn();
    }

    // a server error before the shutdown signal is fatal
    tokio::select! {
        _ = shutdown_signal(shutdown.clone()) => {}
        joined = &mut server_task => {
            joined.context("smtp server task failed")??;
        }
    }

    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give services the opportunity to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
