//! Listener sinks: bounded per-subscription queues of notification envelopes.
//!
//! The registry keeps the [`ListenerSink`] half and delivers into it without
//! ever waiting. The session keeps the [`SinkReceiver`] half and drains it
//! from its delivery loop. When the sink is full the newest envelope is
//! rejected for that subscriber only (reject-newest), counted, and dispatch
//! moves on.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::channel_metrics::{SinkMetrics, SinkMonitor};
use crate::events::NotificationEnvelope;

/// Identifier of a listener sink, unique for the life of the process
pub type SinkId = Uuid;

/// Outcome of a non-blocking delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Envelope queued
    Delivered,
    /// Sink full, envelope discarded for this subscriber
    Dropped,
    /// Receiving side is gone
    Closed,
}

/// Producer half of a listener sink, held by the channel registry
#[derive(Debug, Clone)]
pub struct ListenerSink {
    id: SinkId,
    sender: mpsc::Sender<Arc<NotificationEnvelope>>,
    monitor: SinkMonitor,
}

/// Consumer half of a listener sink, owned by one subscription
#[derive(Debug)]
pub struct SinkReceiver {
    id: SinkId,
    receiver: mpsc::Receiver<Arc<NotificationEnvelope>>,
    monitor: SinkMonitor,
}

/// Create a bounded listener sink for `channel`
pub fn listener_sink(channel: &str, capacity: usize) -> (ListenerSink, SinkReceiver) {
    let id = Uuid::new_v4();
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let monitor = SinkMonitor::new(channel, id, capacity.max(1));

    (
        ListenerSink {
            id,
            sender,
            monitor: monitor.clone(),
        },
        SinkReceiver {
            id,
            receiver,
            monitor,
        },
    )
}

impl ListenerSink {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Queue an envelope without waiting
    pub fn try_deliver(&self, envelope: Arc<NotificationEnvelope>) -> Delivery {
        match self.sender.try_send(envelope) {
            Ok(()) => {
                if self.monitor.record_delivered() {
                    self.monitor.check_health(self.sender.capacity());
                }
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                self.monitor.record_dropped();
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Whether the receiving side has been dropped or closed
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn metrics(&self) -> SinkMetrics {
        self.monitor.metrics()
    }
}

impl SinkReceiver {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Wait for the next envelope; `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<Arc<NotificationEnvelope>> {
        let envelope = self.receiver.recv().await;
        if envelope.is_some() {
            self.monitor.record_consumed();
        }
        envelope
    }

    /// Take the next envelope if one is queued, without waiting
    pub fn try_recv(&mut self) -> Option<Arc<NotificationEnvelope>> {
        let envelope = self.receiver.try_recv().ok();
        if envelope.is_some() {
            self.monitor.record_consumed();
        }
        envelope
    }

    pub fn metrics(&self) -> SinkMetrics {
        self.monitor.metrics()
    }
}
