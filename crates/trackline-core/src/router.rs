//! Fast-path routing of freshly captured samples.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info};

use trackline_types::{EntryId, Sample, UploadResult};

use crate::SharedQueue;
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::CredentialProvider;
use crate::error::Result;
use crate::events::{EventDispatcher, PipelineEvent};
use crate::uploader::Uploader;

/// Why a sample went to the durable queue instead of the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum QueueReason {
    /// No credential was available, so no upload was attempted.
    Unauthenticated,
    /// The monitor reported the network as offline.
    Offline,
    /// An upload was attempted and did not succeed.
    Upload(UploadResult),
}

impl std::fmt::Display for QueueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueReason::Unauthenticated => write!(f, "no credential"),
            QueueReason::Offline => write!(f, "offline"),
            QueueReason::Upload(result) => write!(f, "{}", result),
        }
    }
}

/// Where a routed sample ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Delivered,
    Queued { id: EntryId, reason: QueueReason },
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RouteOutcome::Delivered)
    }
}

/// Decides, per captured sample, between immediate upload and the queue.
///
/// By the time [`SampleRouter::route`] returns `Ok`, the sample has either
/// been acknowledged by the endpoint or committed to the durable queue.
#[derive(Clone)]
pub struct SampleRouter {
    queue: SharedQueue,
    monitor: Arc<ConnectivityMonitor>,
    uploader: Arc<dyn Uploader>,
    credentials: Arc<dyn CredentialProvider>,
    upload_timeout: Duration,
    events: EventDispatcher,
}

impl SampleRouter {
    pub fn new(
        queue: SharedQueue,
        monitor: Arc<ConnectivityMonitor>,
        uploader: Arc<dyn Uploader>,
        credentials: Arc<dyn CredentialProvider>,
        upload_timeout: Duration,
        events: EventDispatcher,
    ) -> Self {
        Self {
            queue,
            monitor,
            uploader,
            credentials,
            upload_timeout,
            events,
        }
    }

    /// Route one sample.
    ///
    /// The only error is a storage fault while queueing; the sample is then
    /// neither delivered nor queued and the caller must report it.
    pub async fn route(&self, sample: Sample) -> Result<RouteOutcome> {
        if self.credentials.token().await.is_none() {
            return self.enqueue(sample, QueueReason::Unauthenticated).await;
        }

        if !self.monitor.current_state().await.is_online() {
            return self.enqueue(sample, QueueReason::Offline).await;
        }

        let result = match timeout(self.upload_timeout, self.uploader.send(&sample)).await {
            Ok(result) => result,
            Err(_) => UploadResult::TransportFailed(format!(
                "upload timed out after {:?}",
                self.upload_timeout
            )),
        };

        match result {
            UploadResult::Delivered => {
                debug!("Delivered {} on the fast path", sample);
                self.events.send(PipelineEvent::SampleDelivered { sample });
                Ok(RouteOutcome::Delivered)
            }
            UploadResult::Unauthenticated => {
                self.enqueue(sample, QueueReason::Unauthenticated).await
            }
            other => self.enqueue(sample, QueueReason::Upload(other)).await,
        }
    }

    async fn enqueue(&self, sample: Sample, reason: QueueReason) -> Result<RouteOutcome> {
        let id = {
            let queue = self.queue.lock().await;
            queue.enqueue(&sample).inspect_err(|e| {
                error!("Failed to queue {}: {}", sample, e);
            })?
        };

        info!("Queued {} as {} ({})", sample, id, reason);
        self.events.send(PipelineEvent::SampleQueued {
            id,
            sample,
            reason: reason.clone(),
        });
        Ok(RouteOutcome::Queued { id, reason })
    }
}
