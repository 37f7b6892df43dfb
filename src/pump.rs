//! # Notification Pump
//!
//! The single background task that turns database notifications into
//! envelopes and hands them to the registry. It parks in the guard's
//! readiness wait, so it holds the connection only while nothing else needs
//! it, and it never blocks on a listener.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionGuard, Readiness};
use crate::error::Result;
use crate::events::{decode_payload, NotificationEnvelope};
use crate::registry::ChannelRegistry;

/// Pump counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub received: u64,
    pub malformed: u64,
    pub last_notification_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct NotificationPump {
    guard: Arc<ConnectionGuard>,
    registry: Arc<ChannelRegistry>,
    read_timeout: Duration,
    received: AtomicU64,
    malformed: AtomicU64,
    last_notification_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl NotificationPump {
    pub fn new(
        guard: Arc<ConnectionGuard>,
        registry: Arc<ChannelRegistry>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            guard,
            registry,
            read_timeout,
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            last_notification_at: parking_lot::Mutex::new(None),
        }
    }

    /// Run until `shutdown` fires or the connection fails
    ///
    /// Returns `Ok(())` on a requested stop. A connection failure has already
    /// closed the guard when the error is returned.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(read_timeout_ms = self.read_timeout.as_millis() as u64, "Notification pump started");

        loop {
            let readiness = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Notification pump stopping");
                    return Ok(());
                }
                readiness = self.guard.wait_readable(self.read_timeout) => readiness,
            };

            match readiness {
                // Commands drain into the buffer too, so every outcome flushes it
                Ok(Readiness::Ready | Readiness::TimedOut | Readiness::Suspended) => {
                    self.process_buffered();
                }
                Err(e) => {
                    error!(error = %e, "Notification pump stopped by connection failure");
                    return Err(e);
                }
            }
        }
    }

    /// Decode and dispatch every buffered notification, in arrival order
    pub fn process_buffered(&self) -> usize {
        let notifications = self.guard.take_buffered();
        let count = notifications.len();
        if count == 0 {
            return 0;
        }

        self.received.fetch_add(count as u64, Ordering::Relaxed);
        *self.last_notification_at.lock() = Some(Utc::now());

        for notification in notifications {
            let decoded = match decode_payload(&notification.channel, &notification.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = %notification.channel,
                        error = %e,
                        "Delivering undecodable payload as raw text"
                    );
                    None
                }
            };
            let envelope =
                NotificationEnvelope::new(notification.channel, notification.payload, decoded);
            let delivered = self.registry.dispatch(envelope);
            debug!(delivered, "Notification dispatched");
        }
        count
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            last_notification_at: *self.last_notification_at.lock(),
        }
    }
}
