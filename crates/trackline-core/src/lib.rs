//! Offline-buffering upload pipeline for captured location samples.
//!
//! Samples captured on a device are delivered to a remote collection
//! endpoint when the network allows and parked in a durable local queue when
//! it does not. Queued samples are delivered later, strictly in capture
//! order.
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ConnectivityMonitor`] | Last known reachability plus a transition stream |
//! | [`Uploader`] / [`HttpUploader`] | One delivery attempt for one sample |
//! | [`CredentialProvider`] | Bearer token, or none |
//! | [`SampleRouter`] | Fast path upload or enqueue, per captured sample |
//! | [`SyncEngine`] | Single-flight, stop-on-first-failure queue drains |
//! | [`Pipeline`] | Runs all of the above against a positioning source |
//! | [`SummaryClient`] | Read-only per-day query of recorded locations |
//!
//! Every sample handed to the router is either acknowledged by the endpoint
//! or committed to the queue before [`SampleRouter::route`] returns.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trackline_core::{
//!     ConnectivityMonitor, HttpUploader, SampleRouter, StaticToken, TcpProbe, UploaderOptions,
//!     EventDispatcher, shared_queue,
//! };
//! use trackline_store::QueueStore;
//! use trackline_types::Sample;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = "https://collector.example.com";
//!     let credentials = Arc::new(StaticToken::new("secret"));
//!     let timeout = std::time::Duration::from_secs(10);
//!
//!     let router = SampleRouter::new(
//!         shared_queue(QueueStore::open_default()?),
//!         Arc::new(ConnectivityMonitor::new(Arc::new(TcpProbe::for_url(endpoint, timeout)?))),
//!         Arc::new(HttpUploader::new(endpoint, credentials.clone(), UploaderOptions::default())?),
//!         credentials,
//!         timeout,
//!         EventDispatcher::default(),
//!     );
//!
//!     let outcome = router.route(Sample::now(52.52, 13.405)?).await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod events;
pub mod mock;
pub mod pipeline;
pub mod router;
pub mod summary;
pub mod sync;
pub mod uploader;

use std::sync::Arc;

use tokio::sync::Mutex;
use trackline_store::QueueStore;

pub use connectivity::{ConnectivityMonitor, ReachabilityProbe, Subscription, TcpProbe};
pub use credentials::{CredentialProvider, NoCredentials, StaticToken, TokenFile};
pub use error::{CaptureError, Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, PipelineEvent};
pub use mock::{MockUploader, StaticProbe};
pub use pipeline::{Pipeline, PipelineHandle, PipelineOptions};
pub use router::{QueueReason, RouteOutcome, SampleRouter};
pub use summary::SummaryClient;
pub use sync::{DrainOutcome, SyncEngine, SyncOptions};
pub use uploader::{HttpUploader, Uploader, UploaderOptions};

/// The durable queue as shared by the router and the sync engine.
///
/// Each queue operation is its own transaction; the lock only serializes
/// access to the SQLite connection.
pub type SharedQueue = Arc<Mutex<QueueStore>>;

/// Wrap a store for sharing.
pub fn shared_queue(store: QueueStore) -> SharedQueue {
    Arc::new(Mutex::new(store))
}
