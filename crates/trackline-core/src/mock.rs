//! Mock collaborators for testing.
//!
//! These stand in for the network so the router and sync engine can be
//! exercised without a collection endpoint.
//!
//! # Features
//!
//! - **Scripted results**: fixed result, per-call queue, or a closure per sample
//! - **Latency simulation**: delay every upload to widen race windows
//! - **Call inspection**: samples sent, call count, peak concurrency

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use trackline_types::{ConnectivityState, Sample, UploadResult};

use crate::connectivity::ReachabilityProbe;
use crate::uploader::Uploader;

type Responder = Box<dyn FnMut(&Sample) -> UploadResult + Send>;

/// An uploader that records what it is asked to send.
///
/// # Example
///
/// ```
/// use trackline_core::{MockUploader, Uploader};
/// use trackline_types::{Sample, UploadResult};
///
/// # #[tokio::main]
/// # async fn main() {
/// let uploader = MockUploader::with_result(UploadResult::Rejected("400".into()));
/// let sample = Sample::now(1.0, 2.0).unwrap();
/// assert!(uploader.send(&sample).await.is_rejected());
/// assert_eq!(uploader.call_count(), 1);
/// # }
/// ```
pub struct MockUploader {
    responder: Mutex<Responder>,
    script: Mutex<VecDeque<UploadResult>>,
    sent: Mutex<Vec<Sample>>,
    latency: Mutex<Duration>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MockUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockUploader")
            .field("calls", &self.calls.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockUploader {
    /// Uploader that accepts everything.
    pub fn delivering() -> Self {
        Self::with_result(UploadResult::Delivered)
    }

    /// Uploader that answers every call with `result`.
    pub fn with_result(result: UploadResult) -> Self {
        Self::with_responder(move |_| result.clone())
    }

    /// Uploader that decides per sample.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&Sample) -> UploadResult + Send + 'static,
    {
        Self {
            responder: Mutex::new(Box::new(responder)),
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = latency;
        self
    }

    /// Replace the fallback result.
    pub fn set_result(&self, result: UploadResult) {
        *lock(&self.responder) = Box::new(move |_| result.clone());
    }

    /// Queue results consumed one per call before the fallback applies.
    pub fn push_results(&self, results: impl IntoIterator<Item = UploadResult>) {
        lock(&self.script).extend(results);
    }

    /// Samples passed to `send`, in call order.
    pub fn sent(&self) -> Vec<Sample> {
        lock(&self.sent).clone()
    }

    /// Number of `send` calls.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous `send` calls observed.
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn send(&self, sample: &Sample) -> UploadResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&self.sent).push(*sample);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = lock(&self.script).pop_front();
        let result = match scripted {
            Some(result) => result,
            None => {
                let mut responder = lock(&self.responder);
                (&mut **responder)(sample)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A reachability probe whose answer is set by the test.
#[derive(Debug)]
pub struct StaticProbe {
    state: Mutex<ConnectivityState>,
    probes: AtomicU32,
}

impl StaticProbe {
    pub fn new(state: ConnectivityState) -> Self {
        Self {
            state: Mutex::new(state),
            probes: AtomicU32::new(0),
        }
    }

    /// Change the answer for subsequent probes.
    pub fn set(&self, state: ConnectivityState) {
        *lock(&self.state) = state;
    }

    /// Number of probes run.
    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn probe(&self) -> ConnectivityState {
        self.probes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
