//! Wiring of capture, routing and sync into one running pipeline.
//!
//! [`Pipeline::start`] consumes a positioning source and runs, until
//! [`PipelineHandle::stop`]:
//!
//! - a capture loop routing each sample on its own task, so a slow upload
//!   never holds up the next sample,
//! - the [`SyncEngine`] loop,
//! - optionally, connectivity polling through the monitor's probe.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trackline_core::{
//!     ConnectivityMonitor, HttpUploader, Pipeline, PipelineOptions, StaticToken, TcpProbe,
//!     UploaderOptions, shared_queue,
//! };
//! use trackline_store::QueueStore;
//! use trackline_types::Sample;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint = "https://collector.example.com";
//! let credentials = Arc::new(StaticToken::new("secret"));
//! let probe = TcpProbe::for_url(endpoint, std::time::Duration::from_secs(3))?;
//!
//! let pipeline = Pipeline::new(
//!     shared_queue(QueueStore::open_default()?),
//!     Arc::new(ConnectivityMonitor::new(Arc::new(probe))),
//!     Arc::new(HttpUploader::new(endpoint, credentials.clone(), UploaderOptions::default())?),
//!     credentials,
//!     PipelineOptions::default(),
//! )?;
//!
//! let source = futures::stream::iter(vec![Sample::now(52.52, 13.405).map_err(Into::into)]);
//! let handle = pipeline.start(source);
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use trackline_types::Sample;

use crate::SharedQueue;
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::CredentialProvider;
use crate::error::{CaptureError, Error, Result};
use crate::events::{EventDispatcher, EventReceiver, PipelineEvent};
use crate::router::SampleRouter;
use crate::sync::{DrainOutcome, SyncEngine, SyncOptions};
use crate::uploader::Uploader;

/// Options for [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub sync: SyncOptions,
    /// Interval for re-running the reachability probe. `None` leaves state
    /// changes to whoever calls the monitor's setters.
    pub probe_interval: Option<Duration>,
    /// Events buffered per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sync: SyncOptions::default(),
            probe_interval: Some(Duration::from_secs(15)),
            event_capacity: 256,
        }
    }
}

impl PipelineOptions {
    #[must_use]
    pub fn sync(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub fn probe_interval(mut self, probe_interval: Option<Duration>) -> Self {
        self.probe_interval = probe_interval;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if self.probe_interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::InvalidConfig("probe interval must be > 0".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event capacity must be > 0".to_string()));
        }
        Ok(())
    }
}

/// The assembled upload pipeline.
pub struct Pipeline {
    queue: SharedQueue,
    monitor: Arc<ConnectivityMonitor>,
    router: SampleRouter,
    engine: Arc<SyncEngine>,
    events: EventDispatcher,
    probe_interval: Option<Duration>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        queue: SharedQueue,
        monitor: Arc<ConnectivityMonitor>,
        uploader: Arc<dyn Uploader>,
        credentials: Arc<dyn CredentialProvider>,
        options: PipelineOptions,
    ) -> Result<Self> {
        options.validate()?;
        let events = EventDispatcher::new(options.event_capacity);

        let router = SampleRouter::new(
            queue.clone(),
            monitor.clone(),
            uploader.clone(),
            credentials,
            options.sync.upload_timeout,
            events.clone(),
        );
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            monitor.clone(),
            uploader,
            options.sync,
            events.clone(),
        )?);

        Ok(Self {
            queue,
            monitor,
            router,
            engine,
            events,
            probe_interval: options.probe_interval,
        })
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &SampleRouter {
        &self.router
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Subscribe to pipeline events.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Run one drain now.
    pub async fn flush(&self) -> Result<DrainOutcome> {
        self.engine.drain().await
    }

    /// Start consuming `source`.
    ///
    /// Source errors are logged and skipped. When the source ends, capture
    /// stops but syncing continues until the handle is stopped.
    pub fn start<S>(&self, source: S) -> PipelineHandle
    where
        S: Stream<Item = std::result::Result<Sample, CaptureError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let source_done = CancellationToken::new();
        let tracker = TaskTracker::new();

        if let Some(every) = self.probe_interval {
            tracker.spawn(self.monitor.clone().poll(every, cancel.clone()));
        }

        tracker.spawn(self.engine.clone().run(cancel.clone()));

        tracker.spawn(capture_loop(
            Box::pin(source),
            self.router.clone(),
            self.events.clone(),
            tracker.clone(),
            cancel.clone(),
            source_done.clone(),
        ));

        info!("Pipeline started");
        PipelineHandle {
            cancel,
            source_done,
            tracker,
        }
    }
}

async fn capture_loop<S>(
    mut source: std::pin::Pin<Box<S>>,
    router: SampleRouter,
    events: EventDispatcher,
    tracker: TaskTracker,
    cancel: CancellationToken,
    source_done: CancellationToken,
) where
    S: Stream<Item = std::result::Result<Sample, CaptureError>> + Send,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = source.next() => item,
        };

        match item {
            Some(Ok(sample)) => {
                debug!("Captured {}", sample);
                let router = router.clone();
                tracker.spawn(async move {
                    if let Err(e) = router.route(sample).await {
                        error!("Sample {} was neither delivered nor queued: {}", sample, e);
                    }
                });
            }
            Some(Err(e)) => {
                warn!("Capture failed: {}", e);
                events.send(PipelineEvent::CaptureFailed {
                    error: e.to_string(),
                });
            }
            None => {
                info!("Positioning source ended");
                break;
            }
        }
    }
    source_done.cancel();
}

/// Handle to a running pipeline.
///
/// Dropping the handle does not stop the pipeline; call
/// [`PipelineHandle::stop`].
#[derive(Debug)]
pub struct PipelineHandle {
    cancel: CancellationToken,
    source_done: CancellationToken,
    tracker: TaskTracker,
}

impl PipelineHandle {
    /// Resolves once the positioning source has ended or capture has stopped.
    pub async fn source_finished(&self) {
        self.source_done.cancelled().await;
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the pipeline and wait for it to wind down.
    ///
    /// New samples are no longer accepted, the connectivity subscription and
    /// timer are dropped, and in-flight routing and any running drain are
    /// allowed to finish. The queue is left as is.
    pub async fn stop(self) {
        info!("Stopping pipeline");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use crate::mock::{MockUploader, StaticProbe};
    use crate::shared_queue;
    use trackline_store::QueueStore;
    use trackline_types::{ConnectivityState, UploadResult};

    fn pipeline(state: ConnectivityState, uploader: Arc<MockUploader>) -> Pipeline {
        Pipeline::new(
            shared_queue(QueueStore::open_in_memory().unwrap()),
            Arc::new(ConnectivityMonitor::new(Arc::new(StaticProbe::new(state)))),
            uploader,
            Arc::new(StaticToken::new("token")),
            PipelineOptions::default().probe_interval(None),
        )
        .unwrap()
    }

    #[test]
    fn test_options_validation() {
        assert!(PipelineOptions::default().validate().is_ok());
        assert!(
            PipelineOptions::default()
                .probe_interval(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        let options = PipelineOptions {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn test_source_errors_are_skipped() {
        let uploader = Arc::new(MockUploader::delivering());
        let pipeline = pipeline(ConnectivityState::Online, uploader.clone());
        let mut events = pipeline.subscribe_events();

        let source = futures::stream::iter(vec![
            Err(CaptureError::Unavailable("no fix".into())),
            Ok(Sample::now(1.0, 1.0).unwrap()),
        ]);
        let handle = pipeline.start(source);
        handle.source_finished().await;
        handle.stop().await;

        assert_eq!(uploader.call_count(), 1);
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PipelineEvent::CaptureFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_routes() {
        let uploader = Arc::new(
            MockUploader::with_result(UploadResult::TransportFailed("down".into()))
                .with_latency(Duration::from_millis(50)),
        );
        let pipeline = pipeline(ConnectivityState::Online, uploader.clone());

        let samples: Vec<_> = (0..5)
            .map(|i| Ok(Sample::now(f64::from(i), 0.0).unwrap()))
            .collect();
        let handle = pipeline.start(futures::stream::iter(samples));
        handle.source_finished().await;
        handle.stop().await;

        // Every routed sample ended up queued before stop returned
        let queue = pipeline.queue().lock().await;
        assert_eq!(queue.pending_count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_flush_runs_one_drain() {
        let uploader = Arc::new(MockUploader::delivering());
        let pipeline = pipeline(ConnectivityState::Online, uploader.clone());
        pipeline
            .queue()
            .lock()
            .await
            .enqueue(&Sample::now(1.0, 2.0).unwrap())
            .unwrap();

        let outcome = pipeline.flush().await.unwrap();

        assert_eq!(outcome, DrainOutcome::Completed { delivered: 1 });
    }
}
