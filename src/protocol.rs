//! Client wire protocol
//!
//! Requests and events are JSON objects naming the event and carrying its
//! fields under `data`:
//!
//! ```json
//! {"event": "subscribe", "data": {"channel": "test"}}
//! {"event": "event", "data": {"channel": "test", "payload": {"arg1": 123}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        #[serde(default)]
        channel: String,
    },
    Unsubscribe {
        #[serde(default)]
        channel: String,
    },
    Publish {
        #[serde(default)]
        channel: String,
        #[serde(default)]
        payload: Option<Value>,
    },
}

impl ClientRequest {
    pub fn channel(&self) -> &str {
        match self {
            Self::Subscribe { channel }
            | Self::Unsubscribe { channel }
            | Self::Publish { channel, .. } => channel,
        }
    }
}

/// Event sent to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ServerHello { client: String },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Published { channel: String },
    Event { channel: String, payload: Value },
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerHello { .. } => "server_hello",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Published { .. } => "published",
            Self::Event { .. } => "event",
            Self::Error { .. } => "error",
        }
    }
}
