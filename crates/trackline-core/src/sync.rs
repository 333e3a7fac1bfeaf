//! Draining the durable queue against the uploader.
//!
//! A drain walks the pending entries oldest-first and stops at the first
//! entry that is not delivered, so the endpoint never sees samples out of
//! capture order and a later entry is never removed while an earlier one is
//! stuck. At most one drain runs at a time; a trigger that arrives while a
//! drain is running is a no-op.
//!
//! Drains are triggered by connectivity becoming online and by a periodic
//! timer, see [`SyncEngine::run`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trackline_types::{EntryId, Sample, UploadResult};

use crate::SharedQueue;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, PipelineEvent};
use crate::uploader::Uploader;

/// Options for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Period of the drain timer.
    pub interval: Duration,
    /// Number of `Rejected` results after which an entry is quarantined.
    /// Transport failures and missing credentials do not count. `None`
    /// retries rejected entries forever.
    pub max_rejections: Option<u32>,
    /// Bound on each upload attempt.
    pub upload_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_rejections: Some(5),
            upload_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncOptions {
    /// Set the drain interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the rejection limit.
    #[must_use]
    pub fn max_rejections(mut self, max_rejections: Option<u32>) -> Self {
        self.max_rejections = max_rejections;
        self
    }

    /// Set the upload timeout.
    #[must_use]
    pub fn upload_timeout(mut self, upload_timeout: Duration) -> Self {
        self.upload_timeout = upload_timeout;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig("sync interval must be > 0".to_string()));
        }
        if self.upload_timeout.is_zero() {
            return Err(Error::InvalidConfig("upload timeout must be > 0".to_string()));
        }
        if self.max_rejections == Some(0) {
            return Err(Error::InvalidConfig(
                "max_rejections must be > 0 (use None to retry forever)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one call to [`SyncEngine::drain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Another drain was running; nothing was done.
    AlreadyRunning,
    /// The network is offline; the queue was not read.
    Offline,
    /// Nothing was pending.
    Empty,
    /// Every pending entry in the snapshot was delivered.
    Completed { delivered: usize },
    /// The pass stopped at `entry`, which was not delivered.
    Halted {
        delivered: usize,
        entry: EntryId,
        result: UploadResult,
        /// Whether `entry` was moved to the dead-letter table.
        quarantined: bool,
    },
}

impl DrainOutcome {
    /// Number of entries delivered during the pass.
    pub fn delivered(&self) -> usize {
        match self {
            DrainOutcome::Completed { delivered } | DrainOutcome::Halted { delivered, .. } => {
                *delivered
            }
            _ => 0,
        }
    }
}

impl std::fmt::Display for DrainOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainOutcome::AlreadyRunning => write!(f, "drain already running"),
            DrainOutcome::Offline => write!(f, "offline"),
            DrainOutcome::Empty => write!(f, "queue empty"),
            DrainOutcome::Completed { delivered } => write!(f, "delivered {}", delivered),
            DrainOutcome::Halted {
                delivered,
                entry,
                result,
                quarantined,
            } => {
                write!(f, "delivered {}, stopped at {}: {}", delivered, entry, result)?;
                if *quarantined {
                    write!(f, " (quarantined)")?;
                }
                Ok(())
            }
        }
    }
}

/// Releases the in-flight flag when a drain ends, including on early return.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Delivers queued entries in capture order, one drain at a time.
pub struct SyncEngine {
    queue: SharedQueue,
    monitor: Arc<ConnectivityMonitor>,
    uploader: Arc<dyn Uploader>,
    options: SyncOptions,
    events: EventDispatcher,
    in_flight: AtomicBool,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("options", &self.options)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        queue: SharedQueue,
        monitor: Arc<ConnectivityMonitor>,
        uploader: Arc<dyn Uploader>,
        options: SyncOptions,
        events: EventDispatcher,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            queue,
            monitor,
            uploader,
            options,
            events,
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Whether a drain is running right now.
    pub fn is_draining(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one drain pass.
    ///
    /// Returns `AlreadyRunning` without touching the queue if another pass
    /// is in progress. A storage fault ends the pass with an error; entries
    /// already removed stay removed and the rest stay queued.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain requested while one is running");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.in_flight);

        let outcome = self.drain_pass().await;
        match &outcome {
            Ok(outcome) => {
                debug!("Drain finished: {}", outcome);
                self.events.send(PipelineEvent::DrainFinished {
                    outcome: outcome.clone(),
                });
            }
            Err(e) => error!("Drain aborted by storage fault: {}", e),
        }
        outcome
    }

    async fn drain_pass(&self) -> Result<DrainOutcome> {
        if !self.monitor.current_state().await.is_online() {
            return Ok(DrainOutcome::Offline);
        }

        let pending = self.queue.lock().await.list_pending()?;
        if pending.is_empty() {
            return Ok(DrainOutcome::Empty);
        }

        info!("Draining {} queued sample(s)", pending.len());
        let mut delivered = 0;

        for entry in pending {
            let result = self.send(&entry.sample).await;

            if result.is_delivered() {
                // A concurrent clear may already have removed it
                self.queue.lock().await.remove(entry.id)?;
                delivered += 1;
                self.events
                    .send(PipelineEvent::EntryDelivered { id: entry.id });
                continue;
            }

            let quarantined = self.record_failure(entry.id, &result).await?;
            if quarantined {
                warn!("Entry {} quarantined after repeated rejection: {}", entry.id, result);
            } else {
                info!("Drain stopped at {}: {}", entry.id, result);
            }

            return Ok(DrainOutcome::Halted {
                delivered,
                entry: entry.id,
                result,
                quarantined,
            });
        }

        info!("Drain delivered {} sample(s)", delivered);
        Ok(DrainOutcome::Completed { delivered })
    }

    async fn send(&self, sample: &Sample) -> UploadResult {
        match timeout(self.options.upload_timeout, self.uploader.send(sample)).await {
            Ok(result) => result,
            Err(_) => UploadResult::TransportFailed(format!(
                "upload timed out after {:?}",
                self.options.upload_timeout
            )),
        }
    }

    /// Record a failed attempt; quarantine the entry once its rejection
    /// count reaches the limit. Returns whether it was quarantined.
    async fn record_failure(&self, id: EntryId, result: &UploadResult) -> Result<bool> {
        let reason = result.to_string();
        let queue = self.queue.lock().await;

        if !matches!(result, UploadResult::Rejected(_)) {
            queue.record_failure(id, &reason)?;
            return Ok(false);
        }

        let rejections = queue.record_rejection(id, &reason)?;
        let limit_reached = self
            .options
            .max_rejections
            .is_some_and(|max| rejections >= max);
        if !limit_reached {
            return Ok(false);
        }

        let moved = queue.quarantine(id, &reason)?;
        drop(queue);
        if moved {
            self.events
                .send(PipelineEvent::EntryQuarantined { id, reason });
        }
        Ok(moved)
    }

    /// Drain on every transition to online and on every timer tick until
    /// `cancel` fires.
    ///
    /// The first timer tick fires immediately, so queued entries left over
    /// from a previous session go out as soon as the engine starts. A
    /// running drain is never interrupted; cancellation is observed between
    /// drains.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut subscription = self.monitor.subscribe();
        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Sync engine started (interval {:?})", self.options.interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                // The engine holds the monitor, so the subscription stays open
                Some(state) = subscription.recv() => {
                    self.events.send(PipelineEvent::ConnectivityChanged { state });
                    if state.is_online() {
                        self.trigger("connectivity").await;
                    }
                }
                _ = ticker.tick() => {
                    self.trigger("timer").await;
                }
            }
        }

        subscription.unsubscribe();
        info!("Sync engine stopped");
    }

    async fn trigger(&self, source: &str) {
        debug!("Drain triggered by {}", source);
        if let Err(e) = self.drain().await {
            warn!("Drain triggered by {} failed: {}", source, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockUploader, StaticProbe};
    use crate::shared_queue;
    use trackline_store::QueueStore;
    use trackline_types::ConnectivityState;
    use time::OffsetDateTime;
    use time::macros::datetime;

    struct Harness {
        engine: Arc<SyncEngine>,
        queue: SharedQueue,
        monitor: Arc<ConnectivityMonitor>,
        uploader: Arc<MockUploader>,
    }

    fn harness(state: ConnectivityState, uploader: MockUploader, options: SyncOptions) -> Harness {
        let queue = shared_queue(QueueStore::open_in_memory().unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(StaticProbe::new(state))));
        let uploader = Arc::new(uploader);
        let engine = Arc::new(
            SyncEngine::new(
                queue.clone(),
                monitor.clone(),
                uploader.clone(),
                options,
                EventDispatcher::default(),
            )
            .unwrap(),
        );
        Harness {
            engine,
            queue,
            monitor,
            uploader,
        }
    }

    fn at(minute: u8) -> OffsetDateTime {
        datetime!(2024-05-01 12:00 UTC) + time::Duration::minutes(i64::from(minute))
    }

    async fn enqueue(queue: &SharedQueue, lat: f64, minute: u8) -> EntryId {
        let sample = Sample::new(lat, 0.0, at(minute)).unwrap();
        queue.lock().await.enqueue(&sample).unwrap()
    }

    #[test]
    fn test_options_validation() {
        assert!(SyncOptions::default().validate().is_ok());
        assert!(
            SyncOptions::default()
                .interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SyncOptions::default()
                .max_rejections(Some(0))
                .validate()
                .is_err()
        );
        assert!(SyncOptions::default().max_rejections(None).validate().is_ok());
    }

    #[tokio::test]
    async fn test_drain_offline_leaves_queue_untouched() {
        let h = harness(
            ConnectivityState::Offline,
            MockUploader::delivering(),
            SyncOptions::default(),
        );
        enqueue(&h.queue, 1.0, 0).await;

        assert_eq!(h.engine.drain().await.unwrap(), DrainOutcome::Offline);
        assert_eq!(h.uploader.call_count(), 0);
        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_empty() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::delivering(),
            SyncOptions::default(),
        );
        assert_eq!(h.engine.drain().await.unwrap(), DrainOutcome::Empty);
    }

    #[tokio::test]
    async fn test_drain_delivers_in_capture_order() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::delivering(),
            SyncOptions::default(),
        );
        // Inserted out of capture order
        enqueue(&h.queue, 3.0, 30).await;
        enqueue(&h.queue, 1.0, 10).await;
        enqueue(&h.queue, 2.0, 20).await;

        let outcome = h.engine.drain().await.unwrap();

        assert_eq!(outcome, DrainOutcome::Completed { delivered: 3 });
        let order: Vec<f64> = h.uploader.sent().iter().map(|s| s.latitude()).collect();
        assert_eq!(order, vec![1.0, 2.0, 3.0]);
        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::delivering(),
            SyncOptions::default(),
        );
        let a = enqueue(&h.queue, 1.0, 1).await;
        let b = enqueue(&h.queue, 2.0, 2).await;
        let c = enqueue(&h.queue, 3.0, 3).await;
        h.uploader.push_results([
            UploadResult::Delivered,
            UploadResult::TransportFailed("timeout".into()),
        ]);

        let outcome = h.engine.drain().await.unwrap();

        assert_eq!(
            outcome,
            DrainOutcome::Halted {
                delivered: 1,
                entry: b,
                result: UploadResult::TransportFailed("timeout".into()),
                quarantined: false,
            }
        );
        assert_eq!(h.uploader.call_count(), 2);
        let ids: Vec<EntryId> = h
            .queue
            .lock()
            .await
            .list_pending()
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![b, c]);
        assert!(!ids.contains(&a));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_entry() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::with_result(UploadResult::Rejected("400 Bad Request".into())),
            SyncOptions::default(),
        );
        enqueue(&h.queue, 1.0, 1).await;

        h.engine.drain().await.unwrap();
        h.engine.drain().await.unwrap();

        let pending = h.queue.lock().await.list_pending().unwrap();
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(
            pending[0].last_error.as_deref(),
            Some("rejected: 400 Bad Request")
        );
    }

    #[tokio::test]
    async fn test_rejection_limit_quarantines() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::with_result(UploadResult::Rejected("422".into())),
            SyncOptions::default().max_rejections(Some(2)),
        );
        let a = enqueue(&h.queue, 1.0, 1).await;
        let b = enqueue(&h.queue, 2.0, 2).await;

        let first = h.engine.drain().await.unwrap();
        assert!(matches!(first, DrainOutcome::Halted { quarantined: false, .. }));

        let second = h.engine.drain().await.unwrap();
        assert_eq!(
            second,
            DrainOutcome::Halted {
                delivered: 0,
                entry: a,
                result: UploadResult::Rejected("422".into()),
                quarantined: true,
            }
        );

        let queue = h.queue.lock().await;
        let pending: Vec<EntryId> = queue.list_pending().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![b]);
        let dead = queue.list_dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, a);
    }

    #[tokio::test]
    async fn test_only_rejections_count_toward_quarantine() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::delivering(),
            SyncOptions::default().max_rejections(Some(2)),
        );
        let a = enqueue(&h.queue, 1.0, 1).await;
        h.uploader.push_results([
            UploadResult::TransportFailed("refused".into()),
            UploadResult::TransportFailed("refused".into()),
            UploadResult::TransportFailed("refused".into()),
            UploadResult::TransportFailed("refused".into()),
            UploadResult::Unauthenticated,
            UploadResult::Rejected("400".into()),
        ]);

        for _ in 0..6 {
            let outcome = h.engine.drain().await.unwrap();
            assert!(matches!(outcome, DrainOutcome::Halted { quarantined: false, .. }));
        }
        {
            let queue = h.queue.lock().await;
            let entry = queue.oldest_pending().unwrap().unwrap();
            assert_eq!(entry.id, a);
            assert_eq!(entry.attempts, 6);
            assert_eq!(entry.rejections, 1);
            assert!(queue.list_dead_letters().unwrap().is_empty());
        }

        h.uploader.push_results([UploadResult::Rejected("400".into())]);
        let outcome = h.engine.drain().await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Halted { quarantined: true, .. }));
        assert_eq!(h.queue.lock().await.list_dead_letters().unwrap()[0].rejections, 2);
    }

    #[tokio::test]
    async fn test_transport_failures_never_quarantine() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::with_result(UploadResult::TransportFailed("refused".into())),
            SyncOptions::default().max_rejections(Some(1)),
        );
        enqueue(&h.queue, 1.0, 1).await;

        for _ in 0..3 {
            h.engine.drain().await.unwrap();
        }

        let queue = h.queue.lock().await;
        assert_eq!(queue.pending_count().unwrap(), 1);
        assert!(queue.list_dead_letters().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlimited_rejections_retry_forever() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::with_result(UploadResult::Rejected("400".into())),
            SyncOptions::default().max_rejections(None),
        );
        enqueue(&h.queue, 1.0, 1).await;

        for _ in 0..10 {
            h.engine.drain().await.unwrap();
        }

        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 1);
        assert_eq!(h.uploader.call_count(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_drains_are_single_flight() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::delivering().with_latency(Duration::from_millis(20)),
            SyncOptions::default(),
        );
        for minute in 0..3 {
            enqueue(&h.queue, f64::from(minute), minute).await;
        }

        let (first, second) = tokio::join!(h.engine.drain(), h.engine.drain());
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, DrainOutcome::AlreadyRunning));

        assert_eq!(
            outcomes,
            vec![
                DrainOutcome::Completed { delivered: 3 },
                DrainOutcome::AlreadyRunning
            ]
        );
        assert_eq!(h.uploader.call_count(), 3);
        assert_eq!(h.uploader.max_concurrent(), 1);
        assert!(!h.engine.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_on_online_transition() {
        let h = harness(
            ConnectivityState::Offline,
            MockUploader::delivering(),
            SyncOptions::default().interval(Duration::from_secs(3600)),
        );
        enqueue(&h.queue, 1.0, 1).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.engine.clone().run(cancel.clone()));

        // Let the immediate first tick run while offline
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 1);

        h.monitor.set_state(ConnectivityState::Online).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_on_timer() {
        let h = harness(
            ConnectivityState::Online,
            MockUploader::delivering(),
            SyncOptions::default().interval(Duration::from_secs(60)),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.engine.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        enqueue(&h.queue, 1.0, 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_queue_and_unsubscribes() {
        let h = harness(
            ConnectivityState::Offline,
            MockUploader::delivering(),
            SyncOptions::default(),
        );
        enqueue(&h.queue, 1.0, 1).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.engine.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.monitor.subscriber_count(), 1);

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(h.monitor.subscriber_count(), 0);
        assert_eq!(h.queue.lock().await.pending_count().unwrap(), 1);
    }
}
