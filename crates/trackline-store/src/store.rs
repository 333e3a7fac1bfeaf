//! Main queue implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Transaction};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

use trackline_types::{EntryId, Sample};

use crate::error::{Error, Result};
use crate::models::{DeadLetter, QueueStats, QueuedEntry};
use crate::schema;

/// Reason recorded for entries evicted by the capacity policy.
pub const EVICTION_REASON: &str = "evicted: queue capacity";

const PENDING_COLUMNS: &str =
    "id, latitude, longitude, captured_at_ns, utc_offset, enqueued_at, attempts, rejections, last_error";

/// SQLite-backed durable queue of unsent samples.
///
/// Every mutating operation is a single SQLite transaction, so an entry is
/// either fully committed or absent after an abrupt termination. Opened from
/// a file, the database runs in WAL mode with `synchronous = FULL`, which
/// makes [`QueueStore::enqueue`] durable by the time it returns.
pub struct QueueStore {
    conn: Connection,
    capacity: Option<u64>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("path", &self.conn.path())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl QueueStore {
    /// Open or create a queue database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening queue database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self {
            conn,
            capacity: None,
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn,
            capacity: None,
        })
    }

    /// Bound the number of pending entries.
    ///
    /// When an enqueue would exceed the bound, the oldest pending entries are
    /// moved to the dead-letter table in the same transaction.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Option<u64>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Configured pending-entry bound, if any.
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}

// Pending queue operations
impl QueueStore {
    /// Persist a new entry and return its id.
    ///
    /// The transaction is committed before this returns. If a capacity bound
    /// is set and the sample is itself the oldest entry, it may be evicted
    /// straight to the dead-letter table; its id is still returned.
    pub fn enqueue(&self, sample: &Sample) -> Result<EntryId> {
        let (captured_at_ns, utc_offset) = encode_timestamp(sample.captured_at())?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO pending (latitude, longitude, captured_at_ns, utc_offset, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                sample.latitude(),
                sample.longitude(),
                captured_at_ns,
                utc_offset,
                now
            ],
        )?;
        let id = EntryId(tx.last_insert_rowid());

        if let Some(capacity) = self.capacity {
            let evicted = evict_over_capacity(&tx, capacity, now)?;
            if evicted > 0 {
                warn!(
                    "Queue over capacity ({}), moved {} oldest entries to dead letters",
                    capacity, evicted
                );
            }
        }

        tx.commit()?;
        debug!("Enqueued {} {}", id, sample);
        Ok(id)
    }

    /// All pending entries, oldest capture first, ties by id.
    pub fn list_pending(&self) -> Result<Vec<QueuedEntry>> {
        let sql = format!(
            "SELECT {} FROM pending ORDER BY captured_at_ns ASC, id ASC",
            PENDING_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], PendingRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(PendingRow::into_entry).collect()
    }

    /// The oldest pending entry, if any.
    pub fn oldest_pending(&self) -> Result<Option<QueuedEntry>> {
        let sql = format!(
            "SELECT {} FROM pending ORDER BY captured_at_ns ASC, id ASC LIMIT 1",
            PENDING_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, [], PendingRow::from_row)
            .optional()?;

        row.map(PendingRow::into_entry).transpose()
    }

    /// Delete one entry by id.
    ///
    /// Returns `false` when no such entry exists, which is not an error.
    pub fn remove(&self, id: EntryId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM pending WHERE id = ?", [id.get()])?;
        debug!("Removed {} (found: {})", id, removed > 0);
        Ok(removed > 0)
    }

    /// Delete every pending entry. Returns how many were removed.
    pub fn clear(&self) -> Result<u64> {
        let removed = self.conn.execute("DELETE FROM pending", [])?;
        info!("Cleared {} pending entries", removed);
        Ok(removed as u64)
    }

    /// Number of pending entries.
    pub fn pending_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Record a failed delivery attempt and return the new attempt count.
    ///
    /// Returns `0` if the entry no longer exists.
    pub fn record_failure(&self, id: EntryId, reason: &str) -> Result<u32> {
        let attempts: Option<i64> = self
            .conn
            .query_row(
                "UPDATE pending SET attempts = attempts + 1, last_error = ?2
                 WHERE id = ?1 RETURNING attempts",
                rusqlite::params![id.get(), reason],
                |row| row.get(0),
            )
            .optional()?;

        Ok(attempts.unwrap_or(0) as u32)
    }

    /// Record an attempt the endpoint rejected and return how many times the
    /// entry has been rejected so far.
    ///
    /// Also counts as a failed attempt. Returns `0` if the entry no longer
    /// exists.
    pub fn record_rejection(&self, id: EntryId, reason: &str) -> Result<u32> {
        let rejections: Option<i64> = self
            .conn
            .query_row(
                "UPDATE pending SET attempts = attempts + 1, rejections = rejections + 1,
                                    last_error = ?2
                 WHERE id = ?1 RETURNING rejections",
                rusqlite::params![id.get(), reason],
                |row| row.get(0),
            )
            .optional()?;

        Ok(rejections.unwrap_or(0) as u32)
    }

    /// Queue counters for status output.
    pub fn stats(&self) -> Result<QueueStats> {
        let dead_letters: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM dead_letter", [], |row| row.get(0))?;

        Ok(QueueStats {
            pending: self.pending_count()?,
            dead_letters: dead_letters as u64,
            oldest_captured_at: self.oldest_pending()?.map(|e| e.sample.captured_at()),
        })
    }
}

// Dead-letter operations
impl QueueStore {
    /// Atomically move a pending entry to the dead-letter table.
    ///
    /// Returns `false` if the entry was not pending.
    pub fn quarantine(&self, id: EntryId, reason: &str) -> Result<bool> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let tx = self.conn.unchecked_transaction()?;
        let moved = move_to_dead_letter(&tx, id.get(), reason, now)?;
        tx.commit()?;

        if moved {
            warn!("Quarantined {}: {}", id, reason);
        }
        Ok(moved)
    }

    /// All dead letters, oldest capture first.
    pub fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, latitude, longitude, captured_at_ns, utc_offset, enqueued_at,
                    attempts, rejections, reason, quarantined_at
             FROM dead_letter ORDER BY captured_at_ns ASC, id ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    PendingRow {
                        id: row.get(0)?,
                        latitude: row.get(1)?,
                        longitude: row.get(2)?,
                        captured_at_ns: row.get(3)?,
                        utc_offset: row.get(4)?,
                        enqueued_at: row.get(5)?,
                        attempts: row.get(6)?,
                        rejections: row.get(7)?,
                        last_error: None,
                    },
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(row, reason, quarantined_at)| {
                let entry = row.into_entry()?;
                Ok(DeadLetter {
                    id: entry.id,
                    sample: entry.sample,
                    enqueued_at: entry.enqueued_at,
                    attempts: entry.attempts,
                    rejections: entry.rejections,
                    reason,
                    quarantined_at: decode_unix(quarantined_at)?,
                })
            })
            .collect()
    }

    /// Move every dead letter back into the pending set.
    ///
    /// Requeued entries get fresh ids and reset counters; captured-at
    /// ordering is unaffected. The capacity bound still applies, so with a
    /// bound set the oldest entries may go straight back to the dead-letter
    /// table. Returns how many were moved.
    pub fn requeue_dead_letters(&self) -> Result<u64> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let tx = self.conn.unchecked_transaction()?;
        let moved = tx.execute(
            "INSERT INTO pending (latitude, longitude, captured_at_ns, utc_offset, enqueued_at)
             SELECT latitude, longitude, captured_at_ns, utc_offset, ?1
             FROM dead_letter ORDER BY captured_at_ns ASC, id ASC",
            [now],
        )?;
        tx.execute("DELETE FROM dead_letter", [])?;

        if let Some(capacity) = self.capacity {
            let evicted = evict_over_capacity(&tx, capacity, now)?;
            if evicted > 0 {
                warn!(
                    "Requeue exceeded capacity ({}), moved {} oldest entries back to dead letters",
                    capacity, evicted
                );
            }
        }

        tx.commit()?;

        info!("Requeued {} dead letters", moved);
        Ok(moved as u64)
    }

    /// Delete every dead letter. Returns how many were removed.
    pub fn clear_dead_letters(&self) -> Result<u64> {
        let removed = self.conn.execute("DELETE FROM dead_letter", [])?;
        info!("Cleared {} dead letters", removed);
        Ok(removed as u64)
    }
}

/// Move the oldest pending rows to the dead-letter table until at most
/// `capacity` remain.
fn evict_over_capacity(tx: &Transaction<'_>, capacity: u64, now: i64) -> Result<u64> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM pending", [], |row| row.get(0))?;
    let excess = (count as u64).saturating_sub(capacity);
    if excess == 0 {
        return Ok(0);
    }

    let ids = {
        let mut stmt = tx.prepare(
            "SELECT id FROM pending ORDER BY captured_at_ns ASC, id ASC LIMIT ?",
        )?;
        stmt.query_map([excess as i64], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    for id in &ids {
        move_to_dead_letter(tx, *id, EVICTION_REASON, now)?;
    }

    Ok(ids.len() as u64)
}

fn move_to_dead_letter(conn: &Connection, id: i64, reason: &str, now: i64) -> Result<bool> {
    let copied = conn.execute(
        "INSERT OR REPLACE INTO dead_letter (id, latitude, longitude, captured_at_ns, utc_offset,
                                  enqueued_at, attempts, rejections, reason, quarantined_at)
         SELECT id, latitude, longitude, captured_at_ns, utc_offset, enqueued_at, attempts,
                rejections, ?2, ?3
         FROM pending WHERE id = ?1",
        rusqlite::params![id, reason, now],
    )?;
    if copied == 0 {
        return Ok(false);
    }
    conn.execute("DELETE FROM pending WHERE id = ?", [id])?;
    Ok(true)
}

/// Raw column values of a queue row, converted outside the rusqlite closure
/// so conversion failures surface as store errors.
struct PendingRow {
    id: i64,
    latitude: f64,
    longitude: f64,
    captured_at_ns: i64,
    utc_offset: i32,
    enqueued_at: i64,
    attempts: i64,
    rejections: i64,
    last_error: Option<String>,
}

impl PendingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            captured_at_ns: row.get(3)?,
            utc_offset: row.get(4)?,
            enqueued_at: row.get(5)?,
            attempts: row.get(6)?,
            rejections: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<QueuedEntry> {
        let captured_at = decode_timestamp(self.captured_at_ns, self.utc_offset)?;
        let sample = Sample::new(self.latitude, self.longitude, captured_at).map_err(|e| {
            Error::InvalidSample {
                id: self.id,
                source: e,
            }
        })?;

        Ok(QueuedEntry {
            id: EntryId(self.id),
            sample,
            enqueued_at: decode_unix(self.enqueued_at)?,
            attempts: self.attempts.max(0) as u32,
            rejections: self.rejections.max(0) as u32,
            last_error: self.last_error,
        })
    }
}

fn encode_timestamp(ts: OffsetDateTime) -> Result<(i64, i32)> {
    let nanos = i64::try_from(ts.unix_timestamp_nanos())
        .map_err(|_| Error::InvalidTimestamp(format!("{} is out of range", ts)))?;
    Ok((nanos, ts.offset().whole_seconds()))
}

fn decode_timestamp(nanos: i64, offset_secs: i32) -> Result<OffsetDateTime> {
    let offset = UtcOffset::from_whole_seconds(offset_secs)
        .map_err(|e| Error::InvalidTimestamp(e.to_string()))?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map(|ts| ts.to_offset(offset))
        .map_err(|e| Error::InvalidTimestamp(e.to_string()))
}

fn decode_unix(secs: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| Error::InvalidTimestamp(e.to_string()))
}
