//! PostgreSQL connection backed by `sqlx::PgListener`
//!
//! `PgListener` already owns a dedicated connection and buffers notifications
//! that arrive while a query runs on it, so control commands and the
//! notification stream share one socket exactly as the guard expects.

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::postgres::{PgListener, PgNotification};
use std::collections::VecDeque;
use tracing::{debug, info, instrument};

use super::{ConnectionCommand, NotifyConnection};
use crate::error::{RelayError, Result};
use crate::events::RawNotification;

/// The single LISTEN/NOTIFY connection to PostgreSQL
pub struct PgNotifyConnection {
    listener: Option<PgListener>,
    pending: VecDeque<RawNotification>,
}

impl std::fmt::Debug for PgNotifyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifyConnection")
            .field("open", &self.listener.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl PgNotifyConnection {
    /// Open a dedicated connection from a DSN
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting notification connection to database");
        let listener = PgListener::connect(database_url)
            .await
            .map_err(map_connect_error)?;
        Ok(Self::from_listener(listener))
    }

    fn from_listener(listener: PgListener) -> Self {
        Self {
            listener: Some(listener),
            pending: VecDeque::new(),
        }
    }

    fn listener(&mut self) -> Result<&mut PgListener> {
        self.listener.as_mut().ok_or(RelayError::ConnectionClosed)
    }
}

#[async_trait]
impl NotifyConnection for PgNotifyConnection {
    async fn execute(&mut self, command: &ConnectionCommand) -> Result<()> {
        let listener = self.listener()?;
        debug!(%command, "Executing command on notification connection");

        let result = match command {
            ConnectionCommand::Listen { channel } => listener.listen(channel).await,
            ConnectionCommand::Unlisten { channel } => listener.unlisten(channel).await,
            ConnectionCommand::Notify { channel, payload } => {
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(channel)
                    .bind(payload)
                    .execute(&mut *listener)
                    .await
                    .map(|_| ())
            }
        };

        result.map_err(map_sqlx_error)
    }

    async fn wait_readable(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            return Ok(());
        }

        let notification = self.listener()?.try_recv().await.map_err(map_sqlx_error)?;
        match notification {
            Some(notification) => {
                self.pending.push_back(to_raw(&notification));
                Ok(())
            }
            // PgListener reports a lost connection as `None` and would silently
            // reconnect on the next call; a lost connection is terminal here.
            None => Err(RelayError::connection_failure(
                "connection to the database was lost",
            )),
        }
    }

    fn drain_available(&mut self, out: &mut VecDeque<RawNotification>) -> Result<usize> {
        let mut drained = self.pending.len();
        out.extend(self.pending.drain(..));

        let listener = self.listener()?;
        loop {
            match listener.try_recv().now_or_never() {
                None => break,
                Some(Ok(Some(notification))) => {
                    out.push_back(to_raw(&notification));
                    drained += 1;
                }
                Some(Ok(None)) => {
                    return Err(RelayError::connection_failure(
                        "connection to the database was lost",
                    ))
                }
                Some(Err(e)) => return Err(map_sqlx_error(e)),
            }
        }

        Ok(drained)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut listener) = self.listener.take() {
            info!("Closing notification connection");
            // Best effort; dropping the listener closes the socket either way
            if let Err(e) = listener.unlisten_all().await {
                debug!(error = %e, "UNLISTEN * failed during close");
            }
        }
        Ok(())
    }
}

fn to_raw(notification: &PgNotification) -> RawNotification {
    RawNotification::new(notification.channel(), notification.payload())
}

fn map_connect_error(error: sqlx::Error) -> RelayError {
    RelayError::connection_failure(format!("failed to connect: {error}"))
}

/// Split driver errors into connection-level failures and statement errors
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> RelayError {
    if is_connection_level(&error) {
        RelayError::connection_failure(error.to_string())
    } else {
        RelayError::Database(error)
    }
}

fn is_connection_level(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
    )
}
