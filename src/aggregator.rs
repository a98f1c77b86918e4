//! Flow aggregator: drives decode and table updates for the packet stream,
//! and sweeps the table on a fixed interval so idle flows get collected even
//! when no further traffic arrives.
//!
//! The aggregator task is the sole owner of the flow table, so ingestion and
//! sweep are mutually excluded by construction. Closed aggregates are handed
//! to the exporter with `try_send`: losing a record under export backpressure
//! is preferable to stalling ingestion, since capture cannot be paused.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::capture::RawFrame;
use crate::collector::FlowRecord;
use crate::config::FlowConfig;
use crate::decoder;
use crate::flow_table::{FlowAggregate, FlowTable};
use crate::metrics::Metrics;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct FlowAggregator {
    table: FlowTable,
    idle_timeout: Duration,
    active_timeout: Duration,
    sweep_interval: Duration,
    export_tx: mpsc::Sender<Vec<FlowRecord>>,
    metrics: Arc<Metrics>,
}

impl FlowAggregator {
    pub fn new(
        cfg: &FlowConfig,
        export_tx: mpsc::Sender<Vec<FlowRecord>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        FlowAggregator {
            table: FlowTable::new(cfg.max_flows),
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            active_timeout: Duration::from_secs(cfg.active_timeout_secs),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            export_tx,
            metrics,
        }
    }

    /// Task body. Ends when the capture channel closes or a shutdown signal
    /// arrives; either way the table is flushed so no flow is lost.
    pub async fn run(mut self, mut frames: mpsc::Receiver<RawFrame>, mut shutdown: mpsc::Receiver<()>) {
        let mut sweep_timer = tokio::time::interval(self.sweep_interval);
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep_timer.tick().await;
        let mut status_timer = tokio::time::interval(STATUS_LOG_INTERVAL);
        status_timer.tick().await;

        info!(
            "Flow aggregator started (idle timeout {:?}, active timeout {:?}, sweep every {:?})",
            self.idle_timeout, self.active_timeout, self.sweep_interval
        );

        loop {
            tokio::select! {
                received = frames.recv() => {
                    match received {
                        Some(frame) => self.ingest(&frame),
                        None => {
                            info!("Capture source ended");
                            break;
                        }
                    }
                }
                _ = sweep_timer.tick() => {
                    self.sweep(Utc::now());
                }
                _ = status_timer.tick() => {
                    info!("Status: {}", self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, flushing flow table");
                    break;
                }
            }
        }

        let flushed = self.table.flush_all();
        info!("Flushed {} open flow(s) at shutdown", flushed.len());
        self.forward(flushed);
        Metrics::set(&self.metrics.active_flows, 0);
    }

    /// Decode + table upsert. Malformed frames are counted, never fatal.
    fn ingest(&mut self, frame: &RawFrame) {
        Metrics::incr(&self.metrics.packets_seen);
        let mut pkt = match decoder::decode(&frame.data, frame.timestamp) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("Dropping undecodable frame: {}", e);
                Metrics::incr(&self.metrics.decode_drops);
                return;
            }
        };
        // Snap-length captures hand us fewer bytes than were on the wire;
        // byte counters track the wire length.
        if frame.wire_len > pkt.frame_len {
            pkt.frame_len = frame.wire_len;
        }

        if let Some(evicted) = self.table.upsert(&pkt) {
            debug!("Flow table at capacity, force-closed oldest flow");
            self.forward(vec![evicted]);
        }
        Metrics::set(&self.metrics.active_flows, self.table.len() as u64);
    }

    /// Timeout sweep; also runs with no traffic so idle flows still close.
    fn sweep(&mut self, now: DateTime<Utc>) {
        let expired = self
            .table
            .collect_expired(now, self.idle_timeout, self.active_timeout);
        if !expired.is_empty() {
            debug!("Sweep closed {} flow(s)", expired.len());
            self.forward(expired);
        }
        Metrics::set(&self.metrics.active_flows, self.table.len() as u64);
    }

    /// Hands closed aggregates to the exporter without blocking. On a full
    /// channel the aggregates are dropped and counted.
    fn forward(&mut self, closed: Vec<FlowAggregate>) {
        if closed.is_empty() {
            return;
        }
        let count = closed.len() as u64;
        Metrics::add(&self.metrics.flows_closed, count);
        let records: Vec<FlowRecord> = closed.into_iter().map(FlowRecord::from).collect();
        match self.export_tx.try_send(records) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Export queue full, dropping {} closed flow(s)", count);
                Metrics::add(&self.metrics.export_queue_drops, count);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Exporter gone, dropping {} closed flow(s)", count);
            }
        }
    }
}
