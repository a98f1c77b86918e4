//! Batch exporter: turns closed flow aggregates into ordered, reliable
//! delivery to the collector.
//!
//! Closed aggregates arrive over a bounded channel, wait in a bounded
//! pending queue, and are cut into sequence-numbered batches either when the
//! queue reaches the batch size or when the batch interval elapses. Each
//! batch is delivered with bounded exponential-backoff retries; a batch that
//! exhausts its budget is staged to disk rather than discarded, and staged
//! batches are replayed in sequence order on the next startup before any new
//! batch is formed. A staged batch never blocks newer ones.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;

use crate::collector::{CollectorClient, ExportBatch, FlowRecord};
use crate::config::ExportConfig;
use crate::metrics::Metrics;
use crate::staging::StagingArea;

/// Retry schedule for one batch: attempt count plus the next backoff delay.
/// Kept separate from any clock so it can be tested by iteration alone.
pub struct RetryState {
    attempts: usize,
    max_attempts: usize,
    backoff: ExponentialBackoff,
}

impl RetryState {
    pub fn new(cfg: &ExportConfig) -> Self {
        // from_millis(2) doubles per attempt; the factor scales the series so
        // the first delay lands on backoff_base_ms.
        let backoff = ExponentialBackoff::from_millis(2)
            .factor(cfg.backoff_base_ms.max(2) / 2)
            .max_delay(Duration::from_secs(cfg.backoff_max_secs));
        RetryState {
            attempts: 0,
            max_attempts: cfg.max_attempts,
            backoff,
        }
    }

    /// Records a failed attempt. Returns the delay before the next attempt,
    /// or None once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            None
        } else {
            self.backoff.next()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

pub struct BatchExporter<C: CollectorClient> {
    client: C,
    client_id: String,
    cfg: ExportConfig,
    staging: StagingArea,
    metrics: Arc<Metrics>,
    pending: VecDeque<FlowRecord>,
    next_sequence: u64,
}

impl<C: CollectorClient> BatchExporter<C> {
    pub fn new(
        client: C,
        client_id: String,
        cfg: ExportConfig,
        staging: StagingArea,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        // Resume numbering above anything already on disk so replayed and new
        // batches never collide at the collector.
        let next_sequence = staging.max_sequence()?.map(|s| s + 1).unwrap_or(1);
        Ok(BatchExporter {
            client,
            client_id,
            cfg,
            staging,
            metrics,
            pending: VecDeque::new(),
            next_sequence,
        })
    }

    /// Main task: replay staged batches, then batch and deliver until the
    /// incoming channel closes, then drain within the shutdown grace period.
    /// The grace deadline starts the moment closure is observed, even when a
    /// delivery is mid-retry at that point.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<FlowRecord>>) {
        self.replay_staged().await;

        let mut flush_timer =
            tokio::time::interval(Duration::from_secs(self.cfg.batch_interval_secs));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        flush_timer.tick().await;

        let deadline = 'open: loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(records) => {
                            self.enqueue(records);
                            while self.pending.len() >= self.cfg.batch_size {
                                let batch = self.cut_batch();
                                if let Some(deadline) =
                                    self.deliver_or_stage(&mut rx, batch).await
                                {
                                    break 'open deadline;
                                }
                            }
                        }
                        None => break 'open self.grace_deadline(),
                    }
                }
                _ = flush_timer.tick() => {
                    if !self.pending.is_empty() {
                        let batch = self.cut_batch();
                        if let Some(deadline) = self.deliver_or_stage(&mut rx, batch).await {
                            break 'open deadline;
                        }
                    }
                }
            }
        };

        self.drain(deadline).await;
    }

    fn grace_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.cfg.shutdown_grace_secs)
    }

    async fn replay_staged(&mut self) {
        let staged = match self.staging.replay() {
            Ok(staged) => staged,
            Err(e) => {
                error!("Cannot read staging area: {}", e);
                Metrics::incr(&self.metrics.staging_failures);
                return;
            }
        };
        if staged.is_empty() {
            return;
        }

        info!("Replaying {} staged batch(es)", staged.len());
        for batch in staged {
            let sequence = batch.sequence;
            match self.client.send_batch(&batch).await {
                Ok(()) => {
                    Metrics::incr(&self.metrics.batches_sent);
                    if let Err(e) = self.staging.remove(sequence) {
                        warn!("Delivered staged batch {} but could not remove it: {}", sequence, e);
                    } else {
                        info!("Re-delivered staged batch {}", sequence);
                    }
                }
                Err(e) => {
                    // Still on disk; it will be retried on the next run.
                    warn!("Staged batch {} still undeliverable: {}", sequence, e);
                }
            }
        }
    }

    /// Admits newly closed flow records, dropping the oldest pending records
    /// when the queue is full. Bounded memory wins over completeness here.
    fn enqueue(&mut self, records: Vec<FlowRecord>) {
        for record in records {
            if self.pending.len() >= self.cfg.max_pending {
                self.pending.pop_front();
                Metrics::incr(&self.metrics.pending_drops);
            }
            self.pending.push_back(record);
        }
    }

    fn cut_batch(&mut self) -> ExportBatch {
        let take = self.pending.len().min(self.cfg.batch_size);
        let flows: Vec<FlowRecord> = self.pending.drain(..take).collect();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!("Cut batch {} with {} flows", sequence, flows.len());
        ExportBatch::new(self.client_id.clone(), sequence, flows)
    }

    /// Delivers one batch with retries; stages it when the budget runs out.
    ///
    /// The incoming channel is watched the whole time (records are still
    /// admitted to the pending queue), so a closed channel is noticed even
    /// mid-attempt or mid-backoff. From that moment the remaining work is
    /// bounded by the grace deadline and the batch is staged rather than
    /// held in memory once the deadline passes. Returns the deadline when
    /// shutdown was observed.
    async fn deliver_or_stage(
        &mut self,
        rx: &mut mpsc::Receiver<Vec<FlowRecord>>,
        batch: ExportBatch,
    ) -> Option<Instant> {
        let mut retry = RetryState::new(&self.cfg);
        let mut deadline: Option<Instant> = None;

        loop {
            let mut buffered: Vec<Vec<FlowRecord>> = Vec::new();
            let outcome = {
                let attempt = self.client.send_batch(&batch);
                tokio::pin!(attempt);
                loop {
                    if let Some(d) = deadline {
                        match tokio::time::timeout_at(d, attempt.as_mut()).await {
                            Ok(result) => break Some(result),
                            Err(_) => break None,
                        }
                    }
                    tokio::select! {
                        result = attempt.as_mut() => break Some(result),
                        received = rx.recv() => match received {
                            Some(records) => buffered.push(records),
                            None => deadline = Some(self.grace_deadline()),
                        }
                    }
                }
            };
            for records in buffered {
                self.enqueue(records);
            }
            let result = match outcome {
                Some(result) => result,
                None => {
                    warn!("Grace period expired for batch {}; staging", batch.sequence);
                    self.stage(&batch);
                    return deadline;
                }
            };

            match result {
                Ok(()) => {
                    Metrics::incr(&self.metrics.batches_sent);
                    debug!("Batch {} acknowledged ({} flows)", batch.sequence, batch.flows.len());
                    return deadline;
                }
                Err(e) => match retry.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Batch {} delivery failed (attempt {}): {}; retrying in {:?}",
                            batch.sequence,
                            retry.attempts(),
                            e,
                            delay
                        );
                        let wait_until = Instant::now() + delay;
                        loop {
                            let wake = deadline.map_or(wait_until, |d| d.min(wait_until));
                            tokio::select! {
                                _ = tokio::time::sleep_until(wake) => break,
                                received = rx.recv(), if deadline.is_none() => match received {
                                    Some(records) => self.enqueue(records),
                                    None => deadline = Some(self.grace_deadline()),
                                }
                            }
                        }
                        if let Some(d) = deadline {
                            if Instant::now() >= d {
                                warn!("Grace period expired for batch {}; staging", batch.sequence);
                                self.stage(&batch);
                                return deadline;
                            }
                        }
                    }
                    None => {
                        warn!(
                            "Batch {} failed after {} attempts: {}; staging",
                            batch.sequence,
                            retry.attempts(),
                            e
                        );
                        self.stage(&batch);
                        return deadline;
                    }
                },
            }
        }
    }

    fn stage(&self, batch: &ExportBatch) {
        match self.staging.stage(batch) {
            Ok(()) => Metrics::incr(&self.metrics.batches_staged),
            Err(e) => {
                // Data loss risk: nothing durable holds this batch anymore.
                error!(
                    "STAGING UNAVAILABLE, dropping batch {} ({} flows): {}",
                    batch.sequence,
                    batch.flows.len(),
                    e
                );
                Metrics::incr(&self.metrics.staging_failures);
            }
        }
    }

    /// Shutdown path: everything still pending is cut into batches and given
    /// one delivery attempt each inside the grace deadline established when
    /// shutdown was observed; whatever is not acknowledged in time is staged.
    async fn drain(&mut self, deadline: Instant) {
        let mut remaining = Vec::new();
        while !self.pending.is_empty() {
            remaining.push(self.cut_batch());
        }
        if remaining.is_empty() {
            return;
        }

        info!("Draining {} final batch(es) before shutdown", remaining.len());

        for batch in remaining {
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                self.stage(&batch);
                continue;
            }
            match tokio::time::timeout(budget, self.client.send_batch(&batch)).await {
                Ok(Ok(())) => {
                    Metrics::incr(&self.metrics.batches_sent);
                    debug!("Final batch {} acknowledged", batch.sequence);
                }
                Ok(Err(e)) => {
                    warn!("Final batch {} failed ({}); staging", batch.sequence, e);
                    self.stage(&batch);
                }
                Err(_) => {
                    warn!("Grace period expired for batch {}; staging", batch.sequence);
                    self.stage(&batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{DeliveryError, DeviceIdentity};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted collector: answers from a fixed list, then succeeds.
    struct MockCollector {
        script: Mutex<VecDeque<bool>>,
        sent: Mutex<Vec<u64>>,
    }

    impl MockCollector {
        fn new(script: Vec<bool>) -> Self {
            MockCollector {
                script: Mutex::new(script.into_iter().collect()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn acknowledged(&self) -> Vec<u64> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CollectorClient for MockCollector {
        async fn send_batch(&self, batch: &ExportBatch) -> Result<(), DeliveryError> {
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                self.sent.lock().unwrap().push(batch.sequence);
                Ok(())
            } else {
                Err(DeliveryError::Status(503))
            }
        }

        async fn register_device(&self, _identity: &DeviceIdentity) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn fast_config(staging_dir: &std::path::Path) -> ExportConfig {
        ExportConfig {
            batch_size: 3,
            batch_interval_secs: 3600,
            max_pending: 10,
            max_attempts: 5,
            backoff_base_ms: 2,
            backoff_max_secs: 1,
            shutdown_grace_secs: 1,
            staging_dir: staging_dir.to_string_lossy().to_string(),
        }
    }

    fn record(port: u16) -> FlowRecord {
        use crate::flow_table::{FlowAggregate, FlowKey, Transport};
        let key = FlowKey {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            src_port: port,
            dst_port: 80,
            protocol: Transport::Tcp,
        };
        let now = chrono::Utc::now();
        FlowRecord::from(FlowAggregate {
            key,
            first_seen: now,
            last_seen: now,
            packets_forward: 1,
            bytes_forward: 64,
            packets_reverse: 0,
            bytes_reverse: 0,
            host: None,
        })
    }

    fn exporter(
        client: Arc<MockCollector>,
        cfg: ExportConfig,
        metrics: Arc<Metrics>,
    ) -> BatchExporter<Arc<MockCollector>> {
        let staging = StagingArea::open(std::path::Path::new(&cfg.staging_dir)).unwrap();
        BatchExporter::new(client, "dev-1".to_string(), cfg, staging, metrics).unwrap()
    }

    impl CollectorClient for Arc<MockCollector> {
        async fn send_batch(&self, batch: &ExportBatch) -> Result<(), DeliveryError> {
            self.as_ref().send_batch(batch).await
        }

        async fn register_device(&self, identity: &DeviceIdentity) -> Result<(), DeliveryError> {
            self.as_ref().register_device(identity).await
        }
    }

    #[test]
    fn retry_state_exhausts_after_budget() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let mut retry = RetryState::new(&cfg);

        let mut delays = 0;
        while retry.next_delay().is_some() {
            delays += 1;
        }
        // max_attempts=5: four delays between five attempts.
        assert_eq!(delays, 4);
        assert_eq!(retry.attempts(), 5);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let dir = TempDir::new().unwrap();
        let mut cfg = fast_config(dir.path());
        cfg.max_attempts = 10;
        cfg.backoff_base_ms = 500;
        cfg.backoff_max_secs = 2;
        let mut retry = RetryState::new(&cfg);

        let first = retry.next_delay().unwrap();
        let second = retry.next_delay().unwrap();
        assert_eq!(first, Duration::from_millis(500));
        assert_eq!(second, Duration::from_millis(1000));
        let mut last = second;
        while let Some(d) = retry.next_delay() {
            last = d;
        }
        assert!(last <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn transient_failures_recover_without_staging() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MockCollector::new(vec![false, false, false, true]));
        let mut exp = exporter(client.clone(), cfg, metrics.clone());

        let (_tx, mut rx) = mpsc::channel::<Vec<FlowRecord>>(1);
        let observed = exp
            .deliver_or_stage(&mut rx, ExportBatch::new("dev-1".to_string(), 1, vec![record(1)]))
            .await;

        assert!(observed.is_none());
        assert_eq!(client.acknowledged(), vec![1]);
        let snap = metrics.snapshot();
        assert_eq!(snap.batches_sent, 1);
        assert_eq!(snap.batches_staged, 0);
        assert_eq!(exp.staging.count(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_stage_the_batch() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MockCollector::new(vec![false; 10]));
        let mut exp = exporter(client.clone(), cfg, metrics.clone());

        let (_tx, mut rx) = mpsc::channel::<Vec<FlowRecord>>(1);
        exp.deliver_or_stage(&mut rx, ExportBatch::new("dev-1".to_string(), 9, vec![record(1)]))
            .await;

        assert!(client.acknowledged().is_empty());
        assert_eq!(metrics.snapshot().batches_staged, 1);
        let staged = exp.staging.replay().unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].sequence, 9);
    }

    #[tokio::test]
    async fn staged_batches_replay_first_and_in_order() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let metrics = Arc::new(Metrics::new());

        {
            let staging = StagingArea::open(dir.path()).unwrap();
            staging
                .stage(&ExportBatch::new("dev-1".to_string(), 5, vec![record(1)]))
                .unwrap();
            staging
                .stage(&ExportBatch::new("dev-1".to_string(), 2, vec![record(2)]))
                .unwrap();
        }

        let client = Arc::new(MockCollector::new(Vec::new()));
        let mut exp = exporter(client.clone(), cfg, metrics.clone());
        // New sequences start above what is staged.
        assert_eq!(exp.next_sequence, 6);

        exp.replay_staged().await;
        assert_eq!(client.acknowledged(), vec![2, 5]);
        assert_eq!(exp.staging.count(), 0);
    }

    #[tokio::test]
    async fn pending_overflow_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let mut cfg = fast_config(dir.path());
        cfg.max_pending = 3;
        cfg.batch_size = 100; // keep everything pending
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MockCollector::new(Vec::new()));
        let mut exp = exporter(client, cfg, metrics.clone());

        exp.enqueue((0..5u16).map(record).collect());
        assert_eq!(exp.pending.len(), 3);
        assert_eq!(metrics.snapshot().pending_drops, 2);
        // Oldest two are gone; ports 2..5 remain.
        assert_eq!(exp.pending.front().unwrap().src_port, 2);
    }

    #[tokio::test]
    async fn run_batches_on_size_threshold_and_drains_on_close() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MockCollector::new(Vec::new()));
        let exp = exporter(client.clone(), cfg, metrics.clone());

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(exp.run(rx));

        // 4 records with batch_size 3: one full batch plus one drained at close.
        tx.send((0..4u16).map(record).collect()).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(client.acknowledged(), vec![1, 2]);
        assert_eq!(metrics.snapshot().batches_sent, 2);
    }

    #[tokio::test]
    async fn shutdown_during_retry_stages_the_inflight_batch() {
        let dir = TempDir::new().unwrap();
        let mut cfg = fast_config(dir.path());
        cfg.batch_size = 1;
        cfg.backoff_base_ms = 60_000; // next attempt far beyond the grace period
        cfg.backoff_max_secs = 120;
        cfg.shutdown_grace_secs = 1;
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MockCollector::new(vec![false; 10]));
        let exp = exporter(client.clone(), cfg, metrics.clone());

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(exp.run(rx));

        tx.send(vec![record(1)]).await.unwrap();
        // First attempt fails and the exporter enters its backoff wait;
        // closing the channel now must not strand the batch in memory.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("exporter must stop within the grace period")
            .unwrap();

        assert!(client.acknowledged().is_empty());
        let staged = StagingArea::open(dir.path()).unwrap().replay().unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].sequence, 1);
        assert_eq!(metrics.snapshot().batches_staged, 1);
    }

    #[tokio::test]
    async fn drain_stages_when_collector_is_down() {
        let dir = TempDir::new().unwrap();
        let mut cfg = fast_config(dir.path());
        cfg.max_attempts = 1;
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(MockCollector::new(vec![false; 10]));
        let exp = exporter(client.clone(), cfg, metrics.clone());

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(exp.run(rx));
        tx.send(vec![record(1)]).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(client.acknowledged().is_empty());
        let staging = StagingArea::open(dir.path()).unwrap();
        assert_eq!(staging.count(), 1);
    }
}
