//! Core types for captured positions and their delivery state.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{SampleError, SampleResult};

/// One captured position reading.
///
/// Samples are immutable values. They have no identity until the durable
/// queue assigns an [`EntryId`]. Ordering comparisons on `captured_at` use the
/// absolute instant, so two samples taken in different UTC offsets still
/// compare by when they actually happened.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    latitude: f64,
    longitude: f64,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    captured_at: OffsetDateTime,
}

impl Sample {
    /// Create a validated sample.
    ///
    /// # Examples
    ///
    /// ```
    /// use time::macros::datetime;
    /// use trackline_types::Sample;
    ///
    /// let sample = Sample::new(10.0, 20.0, datetime!(2024-05-01 12:00 UTC)).unwrap();
    /// assert_eq!(sample.latitude(), 10.0);
    ///
    /// assert!(Sample::new(91.0, 0.0, datetime!(2024-05-01 12:00 UTC)).is_err());
    /// ```
    pub fn new(latitude: f64, longitude: f64, captured_at: OffsetDateTime) -> SampleResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(SampleError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(SampleError::InvalidLongitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
            captured_at,
        })
    }

    /// Create a sample stamped with the current UTC time.
    pub fn now(latitude: f64, longitude: f64) -> SampleResult<Self> {
        Self::new(latitude, longitude, OffsetDateTime::now_utc())
    }

    /// Latitude in decimal degrees.
    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in decimal degrees.
    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// When the position was captured, with the device's UTC offset.
    #[must_use]
    pub fn captured_at(&self) -> OffsetDateTime {
        self.captured_at
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self
            .captured_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.captured_at.to_string());
        write!(f, "({:.6}, {:.6}) @ {}", self.latitude, self.longitude, ts)
    }
}

/// Locally assigned surrogate key of a queued entry.
///
/// Keys are monotonically increasing and never reused, and they are the only
/// handle used to delete an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EntryId(pub i64);

impl EntryId {
    /// Raw database row id.
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<i64> for EntryId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Aggregate network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectivityState {
    /// No transport can reach the network.
    Offline,
    /// At least one transport can reach the network.
    Online,
}

impl ConnectivityState {
    /// Map a reachability flag to a state.
    #[must_use]
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable { Self::Online } else { Self::Offline }
    }

    /// Whether uploads may be attempted.
    #[must_use]
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// A transport whose reachability contributes to [`ConnectivityState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransportKind {
    Cellular,
    Wifi,
    Ethernet,
}

impl TransportKind {
    /// All known transports.
    pub const ALL: [TransportKind; 3] = [Self::Cellular, Self::Wifi, Self::Ethernet];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cellular => write!(f, "cellular"),
            Self::Wifi => write!(f, "wifi"),
            Self::Ethernet => write!(f, "ethernet"),
        }
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "result", content = "detail", rename_all = "snake_case"))]
pub enum UploadResult {
    /// The endpoint acknowledged persistent acceptance.
    Delivered,
    /// Definitive server-side refusal.
    Rejected(String),
    /// Connection error, timeout or transient server fault.
    TransportFailed(String),
    /// No credential was available; no network I/O was attempted.
    Unauthenticated,
}

impl UploadResult {
    /// Whether the sample reached the endpoint.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Whether the endpoint definitively refused the sample.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Short label for logs and events.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Rejected(_) => "rejected",
            Self::TransportFailed(_) => "transport_failed",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for UploadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::TransportFailed(cause) => write!(f, "transport failed: {}", cause),
            Self::Unauthenticated => write!(f, "no credential available"),
        }
    }
}

/// Wire representation of a position, as sent to and returned by the
/// collection endpoint.
///
/// ```json
/// {"latitude": 10.0, "longitude": 20.0, "timestamp": "2024-05-01T12:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

impl From<&Sample> for TrackPoint {
    fn from(sample: &Sample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: sample.captured_at,
        }
    }
}

impl TryFrom<TrackPoint> for Sample {
    type Error = SampleError;

    fn try_from(point: TrackPoint) -> Result<Self, Self::Error> {
        Sample::new(point.latitude, point.longitude, point.timestamp)
    }
}
