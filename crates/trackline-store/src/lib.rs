//! Durable local queue of unsent location samples.
//!
//! This crate provides the SQLite-backed queue that holds samples until the
//! collection endpoint has confirmed them.
//!
//! # Features
//!
//! - Append-only pending queue, ordered by capture time
//! - Entries survive process restart; each enqueue is all-or-nothing
//! - Idempotent removal by entry id
//! - Dead-letter table for quarantined or evicted entries
//! - Optional capacity bound
//!
//! # Example
//!
//! ```no_run
//! use trackline_store::QueueStore;
//! use trackline_types::Sample;
//!
//! let store = QueueStore::open_default()?;
//!
//! let id = store.enqueue(&Sample::now(52.52, 13.405).unwrap())?;
//! for entry in store.list_pending()? {
//!     println!("{} {}", entry.id, entry.sample);
//! }
//! store.remove(id)?;
//! # Ok::<(), trackline_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{DeadLetter, QueueStats, QueuedEntry};
pub use store::{EVICTION_REASON, QueueStore};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/trackline/queue.db`
/// - macOS: `~/Library/Application Support/trackline/queue.db`
/// - Windows: `C:\Users\<user>\AppData\Local\trackline\queue.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("trackline")
        .join("queue.db")
}
