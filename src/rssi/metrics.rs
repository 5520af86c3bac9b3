//! Link health counters.
//!
//! Aggregate counts only; safe to poll from any thread.

use std::sync::atomic::{AtomicU32, Ordering};

/// Counters tracking the health of one RSSI link.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    /// Ingress frames discarded (bad checksum, malformed)
    drops: AtomicU32,
    /// Connection teardowns
    downs: AtomicU32,
    /// Headers retransmitted
    retransmits: AtomicU32,
}

impl LinkMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a discarded ingress frame.
    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection teardown.
    pub fn record_down(&self) {
        self.downs.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a retransmission.
    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames dropped so far.
    pub fn drop_count(&self) -> u32 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Teardowns so far.
    pub fn down_count(&self) -> u32 {
        self.downs.load(Ordering::Relaxed)
    }

    /// Retransmissions so far.
    pub fn retran_count(&self) -> u32 {
        self.retransmits.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            drops: self.drop_count(),
            downs: self.down_count(),
            retransmits: self.retran_count(),
        }
    }
}

/// Plain-data copy of [`LinkMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Ingress frames discarded
    pub drops: u32,
    /// Connection teardowns
    pub downs: u32,
    /// Headers retransmitted
    pub retransmits: u32,
}
