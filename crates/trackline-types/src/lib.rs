//! Platform-agnostic types for the Trackline location upload pipeline.
//!
//! This crate provides the value types shared by the durable queue
//! (trackline-store), the upload pipeline (trackline-core), and the agent.
//!
//! # Example
//!
//! ```
//! use trackline_types::{ConnectivityState, Sample, UploadResult};
//!
//! let sample = Sample::now(52.52, 13.405).unwrap();
//! assert!(ConnectivityState::Online.is_online());
//! assert!(UploadResult::Delivered.is_delivered());
//! # let _ = sample;
//! ```

pub mod error;
pub mod types;

pub use error::{SampleError, SampleResult};
pub use types::{ConnectivityState, EntryId, Sample, TrackPoint, TransportKind, UploadResult};
