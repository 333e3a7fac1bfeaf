//! Error types for trackline-core.
//!
//! Failures of a delivery attempt are not errors here: they are
//! [`trackline_types::UploadResult`] values and always degrade to "the sample
//! stays queued". The variants below cover the remaining faults.
//!
//! | Error | Where it surfaces | Effect |
//! |-------|-------------------|--------|
//! | [`Error::Store`] | `route`, `drain` | Operation aborted, queue keeps its last committed state |
//! | [`Error::InvalidConfig`] | option validation | Fix configuration and restart |
//! | [`Error::InvalidUrl`] | client construction | Fix configuration and restart |
//! | [`Error::Http`] | client construction | TLS backend or builder failure |

use thiserror::Error;

/// Errors raised by the upload pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Local persistence fault.
    #[error("Storage error: {0}")]
    Store(#[from] trackline_store::Error),

    /// Invalid option values.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Endpoint URL could not be used.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias using trackline-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a positioning source for a single capture.
///
/// Sources yield these instead of samples; the pipeline logs them and keeps
/// consuming the stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    /// No fix is available right now.
    #[error("Position unavailable: {0}")]
    Unavailable(String),

    /// The source produced input that is not a position.
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// The source produced coordinates outside the valid range.
    #[error("Invalid sample: {0}")]
    InvalidSample(#[from] trackline_types::SampleError),

    /// The source could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
