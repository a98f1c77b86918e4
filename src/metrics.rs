//! Counters for operator visibility.
//!
//! Degraded delivery has to be detectable without the collector being
//! reachable, so everything here is local: shared atomics, snapshotted into
//! a plain struct for the periodic status log line.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub packets_seen: AtomicU64,
    pub decode_drops: AtomicU64,
    /// Closed aggregates dropped because the exporter channel was full.
    pub export_queue_drops: AtomicU64,
    /// Pending records dropped by the exporter's own overflow policy.
    pub pending_drops: AtomicU64,
    pub flows_closed: AtomicU64,
    pub active_flows: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_staged: AtomicU64,
    pub staging_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_seen: u64,
    pub decode_drops: u64,
    pub export_queue_drops: u64,
    pub pending_drops: u64,
    pub flows_closed: u64,
    pub active_flows: u64,
    pub batches_sent: u64,
    pub batches_staged: u64,
    pub staging_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, n: u64) {
        gauge.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            decode_drops: self.decode_drops.load(Ordering::Relaxed),
            export_queue_drops: self.export_queue_drops.load(Ordering::Relaxed),
            pending_drops: self.pending_drops.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_staged: self.batches_staged.load(Ordering::Relaxed),
            staging_failures: self.staging_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "packets={} decode_drops={} active_flows={} flows_closed={} \
             queue_drops={} pending_drops={} batches_sent={} batches_staged={} staging_failures={}",
            self.packets_seen,
            self.decode_drops,
            self.active_flows,
            self.flows_closed,
            self.export_queue_drops,
            self.pending_drops,
            self.batches_sent,
            self.batches_staged,
            self.staging_failures,
        )
    }
}
