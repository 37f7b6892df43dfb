//! Relay Server Binary
//!
//! Connects to PostgreSQL and serves newline-delimited JSON clients until
//! Ctrl-C or until the database connection is lost.

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{error, info};

use notify_relay::logging::init_structured_logging;
use notify_relay::{NotificationMultiplexer, RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let config = RelayConfig::load().context("failed to load relay configuration")?;
    info!(
        database_url = %config.redacted_database_url(),
        bind_address = %config.bind_address,
        allow_client_publish = config.allow_client_publish,
        "Starting notify relay"
    );

    let multiplexer = NotificationMultiplexer::connect(config)
        .await
        .context("failed to start notification multiplexer")?;

    let server = RelayServer::new(&multiplexer);
    let address = server.start().await.context("failed to start relay server")?;
    info!(%address, "Ready to accept clients");

    let connection_lost = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            false
        }
        _ = multiplexer.closed() => {
            error!("Database connection closed unexpectedly");
            true
        }
    };

    server.stop().await?;
    let shutdown = multiplexer.shutdown().await;
    info!("Notify relay stopped");

    if connection_lost {
        bail!("database connection lost");
    }
    shutdown.context("notification pump failed")?;
    Ok(())
}
