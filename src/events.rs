//! # Notification envelopes
//!
//! A [`RawNotification`] is what the database hands back: a channel and an
//! opaque payload string. The pump turns each one into a
//! [`NotificationEnvelope`], decoding the payload as JSON when it can. A
//! payload that does not decode is still delivered, as a JSON string holding
//! the raw text, so listeners are never starved by a bad writer.
//!
//! ```rust
//! use notify_relay::events::{decode_payload, NotificationEnvelope};
//! use serde_json::json;
//!
//! let decoded = decode_payload("test", r#"{"arg1":123}"#).unwrap();
//! let envelope = NotificationEnvelope::new("test", r#"{"arg1":123}"#, decoded);
//! assert_eq!(envelope.payload(), json!({"arg1": 123}));
//!
//! assert!(decode_payload("test", "not json").is_err());
//! let raw_only = NotificationEnvelope::new("test", "not json", None);
//! assert_eq!(raw_only.payload(), json!("not json"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

/// Notification exactly as received from the database, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

impl RawNotification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// One notification ready for delivery to listener sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Sanitized channel the notification arrived on
    pub channel: String,
    /// Payload text as sent by the publisher
    pub raw_payload: String,
    /// Best-effort JSON decoding of `raw_payload`
    pub decoded: Option<Value>,
    /// When the pump picked the notification up
    pub received_at: DateTime<Utc>,
}

impl NotificationEnvelope {
    pub fn new(
        channel: impl Into<String>,
        raw_payload: impl Into<String>,
        decoded: Option<Value>,
    ) -> Self {
        Self {
            channel: channel.into(),
            raw_payload: raw_payload.into(),
            decoded,
            received_at: Utc::now(),
        }
    }

    /// Payload handed to clients: the decoded value, or the raw text
    pub fn payload(&self) -> Value {
        match &self.decoded {
            Some(value) => value.clone(),
            None => Value::String(self.raw_payload.clone()),
        }
    }

    /// Whether the payload decoded as JSON
    pub fn is_structured(&self) -> bool {
        self.decoded.is_some()
    }
}

/// Decode a notification payload as JSON
///
/// An empty payload (plain `NOTIFY chan`) has nothing to decode and yields
/// `Ok(None)`.
pub fn decode_payload(channel: &str, payload: &str) -> Result<Option<Value>> {
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|source| RelayError::MalformedPayload {
            channel: channel.to_string(),
            source,
        })
}

/// Envelope used by back-end writers that publish named events
///
/// Serialized as `{"event_name": "...", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub event_name: String,
    pub params: Option<Value>,
}

impl PublishedEvent {
    pub fn new(event_name: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            event_name: event_name.into(),
            params,
        }
    }
}
