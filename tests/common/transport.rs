//! Client transport that records every event per session

use async_trait::async_trait;
use notify_relay::{ClientTransport, RelayError, Result, ServerEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RecordingTransport {
    events: Mutex<HashMap<String, Vec<ServerEvent>>>,
    disconnected: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later forward to `session_id` fail
    pub fn disconnect(&self, session_id: &str) {
        self.disconnected.lock().insert(session_id.to_string());
    }

    pub fn events(&self, session_id: &str) -> Vec<ServerEvent> {
        self.events
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// `(channel, payload)` of every `event` delivered to `session_id`
    pub fn notifications(&self, session_id: &str) -> Vec<(String, Value)> {
        self.events(session_id)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::Event { channel, payload } => Some((channel, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, session_id: &str) -> Vec<String> {
        self.events(session_id)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::Error { message } => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClientTransport for RecordingTransport {
    async fn forward_to_client(&self, session_id: &str, event: ServerEvent) -> Result<()> {
        if self.disconnected.lock().contains(session_id) {
            return Err(RelayError::transport("client disconnected"));
        }
        self.events
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(event);
        Ok(())
    }
}
