//! Error types for sample validation in trackline-types.

use thiserror::Error;

/// Errors that can occur when constructing a [`crate::Sample`].
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum SampleError {
    /// Latitude is not finite or outside [-90, 90].
    #[error("Invalid latitude: {0}")]
    InvalidLatitude(f64),

    /// Longitude is not finite or outside [-180, 180].
    #[error("Invalid longitude: {0}")]
    InvalidLongitude(f64),

    /// Timestamp could not be parsed or represented.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Result type alias using trackline-types' SampleError type.
pub type SampleResult<T> = std::result::Result<T, SampleError>;
