//! # Configuration for notify-relay
//!
//! Layered configuration: built-in defaults, then an optional TOML file, then
//! `DATABASE_URL`, then `NOTIFY_RELAY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{RelayError, Result};

/// Largest NOTIFY payload accepted, in bytes; a payload of exactly this size is allowed
pub const PG_NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// Environment variable prefix for overrides, e.g. `NOTIFY_RELAY_SINK_CAPACITY=50`
pub const ENV_PREFIX: &str = "NOTIFY_RELAY";

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "NOTIFY_RELAY_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "notify-relay.toml";

/// Runtime configuration for the multiplexer and the relay server
///
/// # Examples
///
/// ```rust
/// use notify_relay::config::RelayConfig;
///
/// let config = RelayConfig::new()
///     .with_database_url("postgresql://localhost/events")
///     .with_sink_capacity(50);
///
/// assert_eq!(config.max_payload_size, 8000);
/// assert_eq!(config.read_timeout().as_millis(), 300);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// DSN of the database whose NOTIFY traffic is relayed
    pub database_url: String,

    /// Ceiling for serialized publish payloads in bytes
    pub max_payload_size: usize,

    /// Readiness wait timeout; only bounds how long the pump stays parked
    pub read_timeout_ms: u64,

    /// Capacity of each per-subscription listener sink
    pub sink_capacity: usize,

    /// Address the relay server binds to
    pub bind_address: String,

    /// Whether connected clients may publish
    pub allow_client_publish: bool,

    /// Timeout for establishing the database connection
    pub connect_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/notify_relay_development".to_string(),
            max_payload_size: PG_NOTIFY_PAYLOAD_LIMIT,
            read_timeout_ms: 300,
            sink_capacity: 20,
            bind_address: "127.0.0.1:3030".to_string(),
            allow_client_publish: false,
            connect_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default file location and the environment
    ///
    /// Precedence (highest to lowest):
    /// 1. `NOTIFY_RELAY_*` environment variables
    /// 2. `DATABASE_URL` (DSN only)
    /// 3. Config file (`$NOTIFY_RELAY_CONFIG` or `./notify-relay.toml`)
    /// 4. Default values
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(Some(&path))
    }

    /// Load configuration using an explicit (optional) config file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading relay config file if present");
            builder = builder.add_source(config::File::from(path).required(false));
        }

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database_url", database_url)?;
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Set the database URL
    pub fn with_database_url<S: Into<String>>(mut self, url: S) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.min(PG_NOTIFY_PAYLOAD_LIMIT);
        self
    }

    /// Set the readiness wait timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-subscription sink capacity
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    /// Set the relay server bind address
    pub fn with_bind_address<S: Into<String>>(mut self, address: S) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Allow or forbid client publish requests
    pub fn with_client_publish(mut self, allowed: bool) -> Self {
        self.allow_client_publish = allowed;
        self
    }

    /// Readiness wait timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Connection timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(RelayError::config("database_url must not be empty"));
        }

        if self.max_payload_size == 0 || self.max_payload_size > PG_NOTIFY_PAYLOAD_LIMIT {
            return Err(RelayError::config(format!(
                "max_payload_size must be between 1 and {PG_NOTIFY_PAYLOAD_LIMIT} bytes (pg_notify limit)"
            )));
        }

        if self.read_timeout_ms == 0 {
            return Err(RelayError::config("read_timeout_ms must be greater than 0"));
        }

        if self.sink_capacity == 0 {
            return Err(RelayError::config("sink_capacity must be greater than 0"));
        }

        if self.bind_address.trim().is_empty() {
            return Err(RelayError::config("bind_address must not be empty"));
        }

        Ok(())
    }

    /// DSN with the password masked, for logging
    pub fn redacted_database_url(&self) -> String {
        match (self.database_url.find("://"), self.database_url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                let credentials = &self.database_url[scheme_end + 3..at];
                match credentials.find(':') {
                    Some(colon) => format!(
                        "{}{}:***{}",
                        &self.database_url[..scheme_end + 3],
                        &credentials[..colon],
                        &self.database_url[at..]
                    ),
                    None => self.database_url.clone(),
                }
            }
            _ => self.database_url.clone(),
        }
    }
}
