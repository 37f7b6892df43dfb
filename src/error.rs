//! Error types for notify-relay

use thiserror::Error;

/// Result type for notify-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying notifications
#[derive(Error, Debug)]
pub enum RelayError {
    /// Serialized publish payload exceeds the NOTIFY size ceiling
    #[error("Payload size {size} exceeds limit {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Received notification payload could not be decoded as JSON
    #[error("Malformed payload on channel {channel}: {source}")]
    MalformedPayload {
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    /// Statement-level database errors; the connection itself is still usable
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Connection-level failure reported by the driver or the transport below it
    #[error("Connection failure: {message}")]
    ConnectionFailure { message: String },

    /// The shared connection has been closed; nothing further can run on it
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Channel name is empty once sanitized
    #[error("Invalid channel name: {channel:?}")]
    InvalidChannel { channel: String },

    /// Request referenced a session that never connected or already left
    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    /// Client publish requests are turned off in configuration
    #[error("Publishing from clients is disabled")]
    PublishDisabled,

    /// Forwarding an event to a client failed
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Configuration source could not be loaded
    #[error("Configuration source error: {0}")]
    Config(#[from] config::ConfigError),

    /// Socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection failure error
    pub fn connection_failure<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel<S: Into<String>>(channel: S) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
        }
    }

    /// Create an unknown session error
    pub fn unknown_session<S: Into<String>>(session_id: S) -> Self {
        Self::UnknownSession {
            session_id: session_id.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Whether this error means the shared connection is unusable
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. } | Self::ConnectionClosed)
    }

    /// Message suitable for an `error` event sent to a client
    pub fn client_message(&self) -> String {
        match self {
            Self::PayloadTooLarge { limit, .. } => {
                format!("Tried to publish payload with size greater than {limit} bytes")
            }
            Self::InvalidChannel { .. } => "Channel required".to_string(),
            other => other.to_string(),
        }
    }
}
