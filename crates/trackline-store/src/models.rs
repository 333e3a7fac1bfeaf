//! Data models for queued samples.

use serde::Serialize;
use time::OffsetDateTime;

use trackline_types::{EntryId, Sample};

/// A sample waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedEntry {
    /// Surrogate key assigned at enqueue time.
    pub id: EntryId,
    /// The captured position.
    pub sample: Sample,
    /// When the entry was persisted.
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    /// Failed delivery attempts made by the sync engine.
    pub attempts: u32,
    /// How many of those attempts the endpoint rejected.
    pub rejections: u32,
    /// Result of the most recent failed attempt.
    pub last_error: Option<String>,
}

/// An entry moved out of the pending set by policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// Id the entry had while pending.
    pub id: EntryId,
    pub sample: Sample,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub attempts: u32,
    pub rejections: u32,
    /// Why the entry was quarantined.
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub quarantined_at: OffsetDateTime,
}

/// Queue counters for status output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub dead_letters: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest_captured_at: Option<OffsetDateTime>,
}
