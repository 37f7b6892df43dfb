//! # Shared database connection
//!
//! One physical connection carries both the control commands (LISTEN,
//! UNLISTEN, NOTIFY) and the asynchronous notification stream. The
//! [`NotifyConnection`] trait is the seam to the driver; [`ConnectionGuard`]
//! is the only thing allowed to touch an implementation of it.
//!
//! - [`postgres`] - `sqlx::PgListener` backed connection
//! - [`memory`] - in-process loopback with PostgreSQL's LISTEN/NOTIFY rules
//! - [`guard`] - exclusive access, readiness waits and the drained buffer

pub mod guard;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;

use crate::error::Result;
use crate::events::RawNotification;

pub use guard::{ConnectionGuard, GuardStats, Readiness};
pub use memory::{MemoryConnection, MemoryConnectionHandle};
pub use postgres::PgNotifyConnection;

/// Trait object type stored inside the guard
pub type DynConnection = dyn NotifyConnection;

/// Control command issued on the shared connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Listen { channel: String },
    Unlisten { channel: String },
    Notify { channel: String, payload: String },
}

impl ConnectionCommand {
    pub fn listen(channel: impl Into<String>) -> Self {
        Self::Listen {
            channel: channel.into(),
        }
    }

    pub fn unlisten(channel: impl Into<String>) -> Self {
        Self::Unlisten {
            channel: channel.into(),
        }
    }

    pub fn notify(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Notify {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Self::Listen { channel } | Self::Unlisten { channel } | Self::Notify { channel, .. } => {
                channel
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Listen { .. } => "LISTEN",
            Self::Unlisten { .. } => "UNLISTEN",
            Self::Notify { .. } => "NOTIFY",
        }
    }
}

impl fmt::Display for ConnectionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen { channel } => write!(f, "LISTEN \"{channel}\""),
            Self::Unlisten { channel } => write!(f, "UNLISTEN \"{channel}\""),
            Self::Notify { channel, payload } => {
                write!(f, "NOTIFY \"{channel}\" ({} bytes)", payload.len())
            }
        }
    }
}

/// Lifecycle of the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection opened, background listening not started yet
    Connecting,
    /// Parked in the readiness wait
    IdleListening,
    /// A command holds the connection
    CommandExecuting,
    /// Closed on shutdown or after a connection-level failure; terminal
    Closed,
}

/// Driver-facing operations on the single LISTEN/NOTIFY connection
///
/// Implementations are driven exclusively through [`ConnectionGuard`], which
/// guarantees that `execute` and `wait_readable` never run concurrently.
#[async_trait]
pub trait NotifyConnection: Send + 'static {
    /// Run one control command to completion
    ///
    /// Connection-level failures must be reported as
    /// [`RelayError::ConnectionFailure`](crate::error::RelayError::ConnectionFailure).
    async fn execute(&mut self, command: &ConnectionCommand) -> Result<()>;

    /// Resolve once at least one notification can be read
    ///
    /// Must be cancel-safe: the guard drops this future whenever a command
    /// needs the connection.
    async fn wait_readable(&mut self) -> Result<()>;

    /// Move every notification that is available right now into `out`,
    /// preserving arrival order, without waiting
    fn drain_available(&mut self, out: &mut VecDeque<RawNotification>) -> Result<usize>;

    /// Close the underlying connection
    async fn close(&mut self) -> Result<()>;
}
