//! # Session Subscription Manager
//!
//! Owns every client session's subscriptions. Each subscription is a listener
//! sink registered with the channel registry plus a delivery task that drains
//! the sink and forwards each envelope to the client through the
//! [`ClientTransport`].
//!
//! Teardown always cancels delivery tasks before removing their sinks from the
//! registry. Envelopes still queued in a sink at that point are discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::checked_channel;
use crate::error::{RelayError, Result};
use crate::logging::log_channel_operation;
use crate::protocol::{ClientRequest, ServerEvent};
use crate::publisher::Publisher;
use crate::registry::{ChannelRegistry, SubscriptionHandle};
use crate::sink::{listener_sink, SinkReceiver};

/// Outbound half of a client connection
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Send one event to the session's client
    ///
    /// An error ends the delivery task that produced the event and nothing
    /// else.
    async fn forward_to_client(&self, session_id: &str, event: ServerEvent) -> Result<()>;
}

struct Subscription {
    handle: SubscriptionHandle,
    delivery: JoinHandle<()>,
}

struct SessionRecord {
    client: String,
    connected_at: DateTime<Utc>,
    subscriptions: Vec<Subscription>,
}

/// Snapshot of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub client: String,
    pub connected_at: DateTime<Utc>,
    /// Channel of every live subscription, in subscription order
    pub channels: Vec<String>,
}

pub struct SessionManager {
    registry: Arc<ChannelRegistry>,
    publisher: Publisher,
    transport: Arc<dyn ClientTransport>,
    sessions: DashMap<String, SessionRecord>,
    sink_capacity: usize,
    allow_client_publish: bool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("sink_capacity", &self.sink_capacity)
            .field("allow_client_publish", &self.allow_client_publish)
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        publisher: Publisher,
        transport: Arc<dyn ClientTransport>,
        sink_capacity: usize,
    ) -> Self {
        Self {
            registry,
            publisher,
            transport,
            sessions: DashMap::new(),
            sink_capacity,
            allow_client_publish: false,
        }
    }

    /// Accept `publish` requests from clients
    pub fn with_client_publish(mut self, allowed: bool) -> Self {
        self.allow_client_publish = allowed;
        self
    }

    /// Start tracking a session and greet its client
    pub async fn on_connect(&self, session_id: &str, client: &str) {
        let inserted = match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(SessionRecord {
                    client: client.to_string(),
                    connected_at: Utc::now(),
                    subscriptions: Vec::new(),
                });
                true
            }
        };

        if !inserted {
            warn!(session_id, "Session already connected");
            return;
        }
        info!(session_id, client, "Session connected");
        self.emit(
            session_id,
            ServerEvent::ServerHello {
                client: client.to_string(),
            },
        )
        .await;
    }

    /// Subscribe a session to `channel` and start forwarding its notifications
    pub async fn subscribe(&self, session_id: &str, channel: &str) -> Result<SubscriptionHandle> {
        let channel = checked_channel(channel)?;
        if !self.sessions.contains_key(session_id) {
            return Err(RelayError::unknown_session(session_id));
        }

        let (sink, receiver) = listener_sink(&channel, self.sink_capacity);
        let handle = self.registry.subscribe(&channel, sink).await?;
        let delivery = tokio::spawn(deliver(
            session_id.to_string(),
            receiver,
            Arc::clone(&self.transport),
        ));

        let recorded = match self.sessions.get_mut(session_id) {
            Some(mut record) => {
                record.subscriptions.push(Subscription {
                    handle: handle.clone(),
                    delivery,
                });
                None
            }
            None => Some(delivery),
        };

        // The session disconnected while LISTEN was in flight
        if let Some(delivery) = recorded {
            delivery.abort();
            self.registry.unsubscribe(&handle).await?;
            return Err(RelayError::unknown_session(session_id));
        }

        log_channel_operation(
            "subscribe",
            &channel,
            Some(session_id),
            self.registry.listener_count(&channel),
            "ok",
        );
        self.emit(session_id, ServerEvent::Subscribed { channel }).await;
        Ok(handle)
    }

    /// Drop every subscription the session holds on `channel`
    pub async fn unsubscribe(&self, session_id: &str, channel: &str) -> Result<()> {
        let channel = checked_channel(channel)?;
        let removed = {
            let mut record = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RelayError::unknown_session(session_id))?;
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut record.subscriptions)
                .into_iter()
                .partition(|s| s.handle.channel() == channel);
            record.subscriptions = kept;
            removed
        };

        let result = self.teardown(session_id, removed).await;
        log_channel_operation(
            "unsubscribe",
            &channel,
            Some(session_id),
            self.registry.listener_count(&channel),
            if result.is_ok() { "ok" } else { "incomplete" },
        );
        self.emit(session_id, ServerEvent::Unsubscribed { channel })
            .await;
        result
    }

    /// Tear down everything the session owns
    ///
    /// Safe to call for sessions that are unknown or already gone.
    pub async fn on_disconnect(&self, session_id: &str) -> Result<()> {
        let Some((_, record)) = self.sessions.remove(session_id) else {
            debug!(session_id, "Disconnect for unknown session");
            return Ok(());
        };

        let subscriptions = record.subscriptions.len();
        let result = self.teardown(session_id, record.subscriptions).await;
        info!(session_id, subscriptions, "Session disconnected");
        result
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) {
        let session_ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for session_id in session_ids {
            if let Err(e) = self.on_disconnect(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Session teardown incomplete");
            }
        }
    }

    /// Publish on behalf of a client
    pub async fn publish(
        &self,
        session_id: &str,
        channel: &str,
        payload: Option<&Value>,
    ) -> Result<()> {
        if !self.allow_client_publish {
            return Err(RelayError::PublishDisabled);
        }
        if !self.sessions.contains_key(session_id) {
            return Err(RelayError::unknown_session(session_id));
        }
        self.publisher.publish(channel, payload).await
    }

    /// Route one client request, reporting failures to the client
    pub async fn handle_request(&self, session_id: &str, request: ClientRequest) -> Result<()> {
        let result = match &request {
            ClientRequest::Subscribe { channel } => {
                self.subscribe(session_id, channel).await.map(|_| ())
            }
            ClientRequest::Unsubscribe { channel } => self.unsubscribe(session_id, channel).await,
            ClientRequest::Publish { channel, payload } => {
                let published = self.publish(session_id, channel, payload.as_ref()).await;
                if published.is_ok() {
                    let channel = crate::channel::sanitize_channel(channel);
                    self.emit(session_id, ServerEvent::Published { channel })
                        .await;
                }
                published
            }
        };

        if let Err(e) = &result {
            debug!(session_id, error = %e, "Request failed");
            self.emit(session_id, ServerEvent::error(e.client_message()))
                .await;
        }
        result
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|record| SessionInfo {
            session_id: session_id.to_string(),
            client: record.client.clone(),
            connected_at: record.connected_at,
            channels: record
                .subscriptions
                .iter()
                .map(|s| s.handle.channel().to_string())
                .collect(),
        })
    }

    async fn teardown(&self, session_id: &str, subscriptions: Vec<Subscription>) -> Result<()> {
        // Cancel all delivery first so nothing is forwarded after this point
        let handles: Vec<SubscriptionHandle> = subscriptions
            .into_iter()
            .map(|subscription| {
                subscription.delivery.abort();
                subscription.handle
            })
            .collect();

        let mut first_error = None;
        for handle in &handles {
            if let Err(e) = self.registry.unsubscribe(handle).await {
                warn!(
                    session_id,
                    channel = %handle.channel(),
                    error = %e,
                    "Failed to unregister listener"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn emit(&self, session_id: &str, event: ServerEvent) {
        let name = event.name();
        if let Err(e) = self.transport.forward_to_client(session_id, event).await {
            debug!(session_id, event = name, error = %e, "Could not reach client");
        }
    }
}

async fn deliver(session_id: String, mut receiver: SinkReceiver, transport: Arc<dyn ClientTransport>) {
    while let Some(envelope) = receiver.recv().await {
        let event = ServerEvent::Event {
            channel: envelope.channel.clone(),
            payload: envelope.payload(),
        };
        if let Err(e) = transport.forward_to_client(&session_id, event).await {
            warn!(
                session_id = %session_id,
                sink_id = %receiver.id(),
                error = %e,
                "Forwarding failed; stopping delivery for this subscription"
            );
            break;
        }
    }
}
