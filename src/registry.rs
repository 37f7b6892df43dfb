//! # Channel Registry
//!
//! Reference-counted map from channel name to the listener sinks interested
//! in it. LISTEN is issued on the shared connection only when a channel gains
//! its first sink, and UNLISTEN only when it loses its last one.
//!
//! ## Locking
//!
//! - `escalation` (async) serializes subscribe/unsubscribe. It is held across
//!   the LISTEN/UNLISTEN round trip so the "check count, issue command, mutate
//!   map" sequence is atomic with respect to other subscribers.
//! - `channels` (sync) guards the map itself and is only held for short,
//!   non-awaiting sections.
//!
//! Dispatch takes only the `channels` read lock. The pump can therefore keep
//! dispatching while a subscriber waits on the connection, and a subscriber
//! holding `escalation` never waits on the pump.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::channel::checked_channel;
use crate::connection::{ConnectionCommand, ConnectionGuard};
use crate::error::Result;
use crate::events::NotificationEnvelope;
use crate::logging::log_channel_operation;
use crate::sink::{Delivery, ListenerSink, SinkId};

/// Ties one listener sink to the channel it was registered on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SinkId,
    channel: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Sanitized channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub listens_issued: u64,
    pub unlistens_issued: u64,
    /// Envelopes handed to `dispatch` for a known channel
    pub dispatched: u64,
    /// Per-sink deliveries accepted
    pub delivered: u64,
    /// Per-sink deliveries rejected because the sink was full
    pub dropped: u64,
    /// Envelopes for channels with no local listeners
    pub unknown_channel: u64,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    listens_issued: AtomicU64,
    unlistens_issued: AtomicU64,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unknown_channel: AtomicU64,
}

#[derive(Debug)]
pub struct ChannelRegistry {
    guard: Arc<ConnectionGuard>,
    channels: RwLock<HashMap<String, Vec<ListenerSink>>>,
    escalation: Mutex<()>,
    counters: RegistryCounters,
}

impl ChannelRegistry {
    pub fn new(guard: Arc<ConnectionGuard>) -> Self {
        Self {
            guard,
            channels: RwLock::new(HashMap::new()),
            escalation: Mutex::new(()),
            counters: RegistryCounters::default(),
        }
    }

    /// Register `sink` on `channel`, issuing LISTEN if it is the first one
    ///
    /// The channel name is sanitized first. If LISTEN fails the sink is not
    /// registered and the error is returned.
    pub async fn subscribe(&self, channel: &str, sink: ListenerSink) -> Result<SubscriptionHandle> {
        let channel = checked_channel(channel)?;
        let _escalation = self.escalation.lock().await;

        let first_listener = !self.channels.read().contains_key(&channel);
        if first_listener {
            self.guard
                .execute(ConnectionCommand::listen(channel.clone()))
                .await?;
            self.counters.listens_issued.fetch_add(1, Ordering::Relaxed);
            log_channel_operation("listen", &channel, None, 1, "issued");
        }

        let handle = SubscriptionHandle {
            id: sink.id(),
            channel: channel.clone(),
        };
        let listeners = {
            let mut channels = self.channels.write();
            let sinks = channels.entry(channel).or_default();
            sinks.push(sink);
            sinks.len()
        };
        debug!(channel = %handle.channel, sink_id = %handle.id, listeners, "Listener registered");

        Ok(handle)
    }

    /// Remove the sink behind `handle`, issuing UNLISTEN if it was the last
    ///
    /// Unknown handles are ignored so teardown can run more than once. The
    /// entry is removed before UNLISTEN is sent; if UNLISTEN fails the error
    /// is returned and the next subscribe on the channel issues LISTEN again.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let _escalation = self.escalation.lock().await;

        let now_empty = {
            let mut channels = self.channels.write();
            let Some(sinks) = channels.get_mut(&handle.channel) else {
                return Ok(());
            };
            let before = sinks.len();
            sinks.retain(|sink| sink.id() != handle.id);
            if sinks.len() == before {
                return Ok(());
            }
            if sinks.is_empty() {
                channels.remove(&handle.channel);
                true
            } else {
                false
            }
        };
        debug!(channel = %handle.channel, sink_id = %handle.id, "Listener removed");

        if now_empty {
            self.guard
                .execute(ConnectionCommand::unlisten(handle.channel.clone()))
                .await?;
            self.counters
                .unlistens_issued
                .fetch_add(1, Ordering::Relaxed);
            log_channel_operation("unlisten", &handle.channel, None, 0, "issued");
        }
        Ok(())
    }

    /// Offer `envelope` to every sink on its channel without waiting
    ///
    /// Returns the number of sinks that accepted it. A full sink loses this
    /// envelope and dispatch moves on to the next one.
    pub fn dispatch(&self, envelope: NotificationEnvelope) -> usize {
        let envelope = Arc::new(envelope);
        let channels = self.channels.read();
        let Some(sinks) = channels.get(&envelope.channel) else {
            self.counters.unknown_channel.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %envelope.channel, "Notification for channel without listeners");
            return 0;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        for sink in sinks {
            match sink.try_deliver(Arc::clone(&envelope)) {
                Delivery::Delivered => delivered += 1,
                // The sink's monitor logs the drop
                Delivery::Dropped => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                // The owning session is tearing down; unsubscribe removes it
                Delivery::Closed => {}
            }
        }
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of sinks registered on `channel` (sanitized name)
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }

    /// Channels with at least one listener, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            listens_issued: self.counters.listens_issued.load(Ordering::Relaxed),
            unlistens_issued: self.counters.unlistens_issued.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            unknown_channel: self.counters.unknown_channel.load(Ordering::Relaxed),
        }
    }
}
