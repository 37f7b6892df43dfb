//! # Listener sink metrics
//!
//! Every listener sink is a small bounded queue. Dispatch never waits on a
//! sink, so a stalled client shows up here as dropped deliveries and a
//! saturated queue rather than as a stalled pump.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sink health derived from how full its queue is
#[derive(Debug, Clone, PartialEq)]
pub enum SinkHealthStatus {
    /// Below 80% of capacity
    Healthy,
    /// 80-95% of capacity
    Degraded { saturation_percent: f64 },
    /// Above 95% of capacity; the next delivery is likely to be dropped
    Critical { saturation_percent: f64 },
}

impl SinkHealthStatus {
    /// Create health status from saturation (0.0-1.0)
    pub fn from_saturation(saturation: f64) -> Self {
        if saturation >= 0.95 {
            Self::Critical {
                saturation_percent: saturation * 100.0,
            }
        } else if saturation >= 0.80 {
            Self::Degraded {
                saturation_percent: saturation * 100.0,
            }
        } else {
            Self::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Point-in-time counters for one sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkMetrics {
    /// Envelopes accepted into the queue
    pub delivered: u64,
    /// Envelopes taken off the queue by the delivery loop
    pub consumed: u64,
    /// Envelopes rejected because the queue was full
    pub dropped: u64,
}

/// Shared counters for one listener sink
///
/// Cloning is cheap; clones share the same counters.
#[derive(Debug, Clone)]
pub struct SinkMonitor {
    label: Arc<str>,
    capacity: usize,
    delivered: Arc<AtomicU64>,
    consumed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl SinkMonitor {
    /// Create a monitor for a sink on `channel`
    pub fn new(channel: &str, sink_id: impl std::fmt::Display, capacity: usize) -> Self {
        let label: Arc<str> = Arc::from(format!("{channel}/{sink_id}"));
        debug!(sink = %label, capacity, "Listener sink created");
        Self {
            label,
            capacity,
            delivered: Arc::new(AtomicU64::new(0)),
            consumed: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an accepted delivery
    ///
    /// Returns `true` when the caller should sample saturation. Sampling every
    /// delivery would be wasteful for busy channels, so it happens once per
    /// `capacity` deliveries.
    pub fn record_delivered(&self) -> bool {
        let count = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        count % (self.capacity.max(1) as u64) == 0
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery rejected because the sink was full
    pub fn record_dropped(&self) {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;

        warn!(
            sink = %self.label,
            delivered,
            dropped,
            drop_rate_percent = (dropped as f64 / (delivered + dropped) as f64) * 100.0,
            "Listener sink full - notification DROPPED for this subscriber"
        );
    }

    /// Saturation from the queue's remaining capacity (0.0 empty, 1.0 full)
    pub fn calculate_saturation(&self, available_capacity: usize) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        let used = self.capacity.saturating_sub(available_capacity);
        used as f64 / self.capacity as f64
    }

    /// Compute health and warn when the sink is close to full
    pub fn check_health(&self, available_capacity: usize) -> SinkHealthStatus {
        let status = SinkHealthStatus::from_saturation(self.calculate_saturation(available_capacity));
        match &status {
            SinkHealthStatus::Critical { saturation_percent } => warn!(
                sink = %self.label,
                saturation_percent,
                "CRITICAL: listener sink critically full (>95%)"
            ),
            SinkHealthStatus::Degraded { saturation_percent } => warn!(
                sink = %self.label,
                saturation_percent,
                "Listener sink approaching capacity (>80%)"
            ),
            SinkHealthStatus::Healthy => {}
        }
        status
    }

    pub fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            delivered: self.delivered.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
