//! Network reachability tracking.
//!
//! [`ConnectivityMonitor`] keeps the last known [`ConnectivityState`] and
//! publishes every transition to any number of [`Subscription`]s. State comes
//! from three places:
//!
//! - platform integrations pushing per-transport signals via
//!   [`ConnectivityMonitor::report_transport`] (the aggregate is online when
//!   any transport is reachable),
//! - integrations that only know the aggregate, via
//!   [`ConnectivityMonitor::set_state`],
//! - a [`ReachabilityProbe`], run once on first access and optionally on an
//!   interval by [`ConnectivityMonitor::poll`].
//!
//! Duplicate consecutive states can be published. Consumers treat them as
//! idempotent triggers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trackline_types::{ConnectivityState, TransportKind};

use crate::error::{Error, Result};

/// A one-shot reachability check.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> ConnectivityState;
}

/// Probe that considers the network reachable when a TCP connection to the
/// collection endpoint can be opened within the timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe a `host:port` address.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// Probe the host and port of an HTTP(S) URL.
    pub fn for_url(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{} has no host", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(format!("{} has no port", url)))?;
        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    /// Address this probe connects to.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> ConnectivityState {
        match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => ConnectivityState::Online,
            Ok(Err(e)) => {
                debug!("Reachability probe to {} failed: {}", self.address, e);
                ConnectivityState::Offline
            }
            Err(_) => {
                debug!(
                    "Reachability probe to {} timed out after {:?}",
                    self.address, self.timeout
                );
                ConnectivityState::Offline
            }
        }
    }
}

/// Tracks connectivity and fans transitions out to subscribers.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    state: RwLock<Option<ConnectivityState>>,
    transports: std::sync::Mutex<BTreeMap<TransportKind, bool>>,
    first_check: Mutex<()>,
    sender: broadcast::Sender<ConnectivityState>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Default number of transitions buffered per subscriber.
    pub const DEFAULT_BUFFER: usize = 64;

    /// Create a monitor backed by the given probe. No check runs until the
    /// state is first requested.
    pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
        let (sender, _) = broadcast::channel(Self::DEFAULT_BUFFER);
        Self {
            probe,
            state: RwLock::new(None),
            transports: std::sync::Mutex::new(BTreeMap::new()),
            first_check: Mutex::new(()),
            sender,
        }
    }

    /// Last known state.
    ///
    /// If nothing has been observed yet, runs exactly one probe; concurrent
    /// first callers wait for and share that result.
    pub async fn current_state(&self) -> ConnectivityState {
        if let Some(state) = *self.state.read().await {
            return state;
        }

        let _check = self.first_check.lock().await;
        if let Some(state) = *self.state.read().await {
            return state;
        }

        let probed = self.probe.probe().await;
        debug!("Initial connectivity check: {}", probed);

        let mut state = self.state.write().await;
        // A push signal that landed during the probe is newer
        if let Some(pushed) = *state {
            return pushed;
        }
        self.publish_locked(&mut state, probed);
        probed
    }

    /// Last known state without probing.
    pub async fn last_known(&self) -> Option<ConnectivityState> {
        *self.state.read().await
    }

    /// Subscribe to transitions published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an aggregate state.
    pub async fn set_state(&self, state: ConnectivityState) {
        self.publish(state).await;
    }

    /// Record a per-transport reachability signal and publish the resulting
    /// aggregate state.
    pub async fn report_transport(&self, transport: TransportKind, reachable: bool) {
        let mut state = self.state.write().await;
        let any_reachable = {
            let mut transports = match self.transports.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            transports.insert(transport, reachable);
            transports.values().any(|r| *r)
        };
        debug!("Transport {} reachable={}", transport, reachable);
        self.publish_locked(&mut state, ConnectivityState::from_reachable(any_reachable));
    }

    /// Run the probe every `every` until cancelled, publishing only changes.
    pub async fn poll(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Polling connectivity every {:?}", every);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let probed = self.probe.probe().await;
                    let mut state = self.state.write().await;
                    if *state != Some(probed) {
                        self.publish_locked(&mut state, probed);
                    }
                }
            }
        }
        debug!("Connectivity polling stopped");
    }

    async fn publish(&self, state: ConnectivityState) {
        let mut current = self.state.write().await;
        self.publish_locked(&mut current, state);
    }

    /// Store and broadcast under the state lock, so subscribers see
    /// transitions in the order the state was written.
    fn publish_locked(&self, current: &mut Option<ConnectivityState>, state: ConnectivityState) {
        if current.replace(state) != Some(state) {
            info!("Connectivity is now {}", state);
        }
        // Ignore error if no subscribers
        let _ = self.sender.send(state);
    }
}

/// Handle to a stream of connectivity transitions.
///
/// Delivery to this subscriber stops when the handle is dropped or
/// [`Subscription::unsubscribe`] is called; other subscribers are unaffected.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ConnectivityState>,
}

impl Subscription {
    /// Next transition, in publication order.
    ///
    /// A subscriber that falls behind the buffer skips the oldest missed
    /// transitions and continues with the ones still buffered. Returns `None`
    /// once the monitor is gone.
    pub async fn recv(&mut self) -> Option<ConnectivityState> {
        loop {
            match self.receiver.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Connectivity subscriber lagged, skipped {} transitions", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving transitions.
    pub fn unsubscribe(self) {}
}
