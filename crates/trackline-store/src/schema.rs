//! Database schema and migrations.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        create_schema_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version, `0` when the database is uninitialized.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Create the initial schema (version 1).
///
/// `pending` uses `AUTOINCREMENT` so a row id is never handed out twice, even
/// after the newest rows are deleted or the table is cleared. Timestamps are
/// stored as UTC nanoseconds plus the original offset in seconds, so ordering
/// is by absolute instant while the capture offset survives a round trip.
///
/// The version row is written in the same transaction as the tables, and
/// every statement is idempotent, so an interrupted first open is simply
/// redone on the next one.
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Samples waiting for confirmed delivery
        CREATE TABLE IF NOT EXISTS pending (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            captured_at_ns INTEGER NOT NULL,
            utc_offset INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            rejections INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_pending_captured
            ON pending(captured_at_ns, id);

        -- Entries taken out of the pending set by rejection or capacity policy
        CREATE TABLE IF NOT EXISTS dead_letter (
            id INTEGER PRIMARY KEY,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            captured_at_ns INTEGER NOT NULL,
            utc_offset INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            rejections INTEGER NOT NULL DEFAULT 0,
            reason TEXT NOT NULL,
            quarantined_at INTEGER NOT NULL
        );

        INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, 1);

        COMMIT;
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"pending".to_string()));
        assert!(tables.contains(&"dead_letter".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_schema_version_tracking() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Re-initializing an existing database is a no-op
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_missing_version_row_is_reinitialized() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute("DELETE FROM schema_version", []).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 0);
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_failed_first_open_leaves_nothing_behind() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE pending (id INTEGER PRIMARY KEY);")
            .unwrap();

        // Index creation fails on the pre-existing table, so the whole batch rolls back
        assert!(create_schema_v1(&conn).is_err());
        let _ = conn.execute_batch("ROLLBACK;");
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
    }
}
