//! # Notification Multiplexer
//!
//! Wires the shared connection, channel registry, pump and publisher into one
//! running unit. One multiplexer per process serves any number of sessions.
//!
//! ```rust,no_run
//! use notify_relay::{NotificationMultiplexer, RelayConfig};
//!
//! # async fn example() -> notify_relay::Result<()> {
//! let multiplexer = NotificationMultiplexer::connect(RelayConfig::load()?).await?;
//! multiplexer.publisher().publish("test", None).await?;
//! multiplexer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::connection::{
    ConnectionGuard, ConnectionState, DynConnection, GuardStats, PgNotifyConnection,
};
use crate::error::{RelayError, Result};
use crate::publisher::Publisher;
use crate::pump::{NotificationPump, PumpStats};
use crate::registry::{ChannelRegistry, RegistryStats};
use crate::session::{ClientTransport, SessionManager};

/// Combined runtime statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub state: ConnectionState,
    pub channels: usize,
    pub guard: GuardStats,
    pub registry: RegistryStats,
    pub pump: PumpStats,
}

#[derive(Debug)]
pub struct NotificationMultiplexer {
    config: RelayConfig,
    guard: Arc<ConnectionGuard>,
    registry: Arc<ChannelRegistry>,
    publisher: Publisher,
    pump: Arc<NotificationPump>,
    shutdown_tx: broadcast::Sender<()>,
    pump_task: parking_lot::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl NotificationMultiplexer {
    /// Connect to PostgreSQL and start the pump
    pub async fn connect(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        info!(database_url = %config.redacted_database_url(), "Connecting notification multiplexer");

        let connection = tokio::time::timeout(
            config.connect_timeout(),
            PgNotifyConnection::connect(&config.database_url),
        )
        .await
        .map_err(|_| {
            RelayError::connection_failure(format!(
                "timed out after {}ms connecting to the database",
                config.connect_timeout_ms
            ))
        })??;

        Self::with_connection(Box::new(connection), config)
    }

    /// Start a multiplexer on an already open connection
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_connection(connection: Box<DynConnection>, config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let guard = Arc::new(ConnectionGuard::new(connection));
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&guard)));
        let publisher = Publisher::new(Arc::clone(&guard), config.max_payload_size);
        let pump = Arc::new(NotificationPump::new(
            Arc::clone(&guard),
            Arc::clone(&registry),
            config.read_timeout(),
        ));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let pump_task = {
            let pump = Arc::clone(&pump);
            tokio::spawn(async move { pump.run(shutdown_rx).await })
        };

        Ok(Self {
            config,
            guard,
            registry,
            publisher,
            pump,
            shutdown_tx,
            pump_task: parking_lot::Mutex::new(Some(pump_task)),
        })
    }

    /// Build a session manager bound to this multiplexer
    pub fn session_manager(&self, transport: Arc<dyn ClientTransport>) -> SessionManager {
        SessionManager::new(
            Arc::clone(&self.registry),
            self.publisher.clone(),
            transport,
            self.config.sink_capacity,
        )
        .with_client_publish(self.config.allow_client_publish)
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn guard(&self) -> &Arc<ConnectionGuard> {
        &self.guard
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Resolve once the shared connection is closed
    ///
    /// After a connection failure this is how the owner learns that the
    /// multiplexer has stopped.
    pub async fn closed(&self) {
        self.guard.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Stop the pump and close the connection
    ///
    /// Returns the pump's error if it had already stopped on a connection
    /// failure.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down notification multiplexer");
        let _ = self.shutdown_tx.send(());

        let pump_task = self.pump_task.lock().take();
        let pump_result = match pump_task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Notification pump task panicked");
                    Err(RelayError::connection_failure(format!(
                        "notification pump aborted: {e}"
                    )))
                }
            },
            None => Ok(()),
        };

        if let Err(e) = self.guard.close().await {
            warn!(error = %e, "Error while closing connection");
        }
        pump_result
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            state: self.guard.state(),
            channels: self.registry.channels().len(),
            guard: self.guard.stats(),
            registry: self.registry.stats(),
            pump: self.pump.stats(),
        }
    }
}

impl Drop for NotificationMultiplexer {
    fn drop(&mut self) {
        // Stops a pump that was never shut down explicitly
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::sink::listener_sink;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_round_trips_through_connection() {
        let (conn, _handle) = MemoryConnection::new();
        let multiplexer =
            NotificationMultiplexer::with_connection(Box::new(conn), RelayConfig::default())
                .unwrap();

        let (sink, mut rx) = listener_sink("test", 20);
        multiplexer.registry().subscribe("test", sink).await.unwrap();
        multiplexer
            .publisher()
            .publish("test", Some(&json!({"arg1": 123, "arg2": true})))
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload(), json!({"arg1": 123, "arg2": true}));

        multiplexer.shutdown().await.unwrap();
        assert!(multiplexer.is_closed());
    }

    #[tokio::test]
    async fn test_connection_failure_is_escalated() {
        let (conn, handle) = MemoryConnection::new();
        let multiplexer =
            NotificationMultiplexer::with_connection(Box::new(conn), RelayConfig::default())
                .unwrap();

        handle.sever();
        tokio::time::timeout(Duration::from_secs(1), multiplexer.closed())
            .await
            .expect("multiplexer closes after connection loss");
        assert_eq!(multiplexer.stats().state, ConnectionState::Closed);
        assert!(multiplexer.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (conn, _handle) = MemoryConnection::new();
        let config = RelayConfig::default().with_sink_capacity(0);
        assert!(NotificationMultiplexer::with_connection(Box::new(conn), config).is_err());
    }
}
