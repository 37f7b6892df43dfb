#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Notify Relay
//!
//! Relays PostgreSQL `NOTIFY` messages on named channels to many concurrently
//! connected clients, and lets clients and back-end code publish onto those
//! channels.
//!
//! ## Architecture
//!
//! One database connection carries every LISTEN, UNLISTEN and NOTIFY as well
//! as the incoming notification stream. Around it:
//!
//! - [`connection`] - the shared connection and the guard serializing access
//! - [`registry`] - reference-counted channel map; LISTEN on first listener,
//!   UNLISTEN on last
//! - [`pump`] - background task decoding notifications and fanning them out
//! - [`publisher`] - size-checked NOTIFY
//! - [`session`] - per-client subscriptions, delivery tasks and teardown
//! - [`server`] - newline-delimited JSON over TCP
//! - [`multiplexer`] - wires the above together
//!
//! Publishing never short-circuits locally: a message published by a client
//! reaches local subscribers through the database, like any other.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notify_relay::{NotificationMultiplexer, RelayConfig, RelayServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load()?;
//! let multiplexer = NotificationMultiplexer::connect(config).await?;
//! let server = RelayServer::new(&multiplexer);
//! server.start().await?;
//!
//! multiplexer.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod channel_metrics;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod multiplexer;
pub mod protocol;
pub mod publisher;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;

pub use channel::{checked_channel, sanitize_channel};
pub use config::RelayConfig;
pub use connection::{
    ConnectionCommand, ConnectionGuard, ConnectionState, MemoryConnection, NotifyConnection,
    PgNotifyConnection,
};
pub use error::{RelayError, Result};
pub use events::{NotificationEnvelope, PublishedEvent};
pub use multiplexer::{MultiplexerStats, NotificationMultiplexer};
pub use protocol::{ClientRequest, ServerEvent};
pub use publisher::Publisher;
pub use registry::{ChannelRegistry, SubscriptionHandle};
pub use server::RelayServer;
pub use session::{ClientTransport, SessionManager};
