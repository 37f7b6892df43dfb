//! # Publisher
//!
//! Sends payloads to a channel with NOTIFY over the shared connection. The
//! payload is validated before the connection is touched, so an oversized
//! publish costs no round trip. Local listeners receive the message the same
//! way remote ones do, through the database and the pump.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::channel::checked_channel;
use crate::config::PG_NOTIFY_PAYLOAD_LIMIT;
use crate::connection::{ConnectionCommand, ConnectionGuard};
use crate::error::{RelayError, Result};
use crate::events::PublishedEvent;

#[derive(Debug, Clone)]
pub struct Publisher {
    guard: Arc<ConnectionGuard>,
    max_payload_size: usize,
}

impl Publisher {
    pub fn new(guard: Arc<ConnectionGuard>, max_payload_size: usize) -> Self {
        Self {
            guard,
            max_payload_size: max_payload_size.min(PG_NOTIFY_PAYLOAD_LIMIT),
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Publish `payload` on `channel`
    ///
    /// An absent or empty payload (`null`, `false`, `0`, `""`, `[]`) is sent
    /// as `{}`.
    #[instrument(skip(self, payload))]
    pub async fn publish(&self, channel: &str, payload: Option<&Value>) -> Result<()> {
        let command = match payload.filter(|p| !is_empty_payload(p)) {
            Some(payload) => self.build_payload(channel, payload)?,
            None => self.build_payload(channel, &Value::Object(Default::default()))?,
        };
        self.guard.execute(command).await?;
        debug!("Published notification");
        Ok(())
    }

    /// Publish a named server-side event as `{"event_name": .., "params": ..}`
    pub async fn publish_event(
        &self,
        channel: &str,
        event_name: &str,
        params: Option<Value>,
    ) -> Result<()> {
        let event = PublishedEvent::new(event_name, params);
        let command = self.build_payload(channel, &event)?;
        self.guard.execute(command).await
    }

    /// Sanitize the channel, serialize `payload` and check the size ceiling
    ///
    /// Nothing is sent; the returned command is what `publish` would issue.
    pub fn build_payload<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<ConnectionCommand> {
        let channel = checked_channel(channel)?;
        let serialized = serde_json::to_string(payload)?;
        if serialized.len() > self.max_payload_size {
            return Err(RelayError::PayloadTooLarge {
                size: serialized.len(),
                limit: self.max_payload_size,
            });
        }
        Ok(ConnectionCommand::notify(channel, serialized))
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}
