//! SQLite schema for the local store.

use rusqlite::Connection;
use std::time::Duration;

use shopsync_common::Result;

use crate::SqlResultExt;

const SCHEMA_VERSION: i64 = 1;

/// Configure the connection and create tables if they do not exist yet.
pub(crate) fn init(conn: &Connection) -> Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .storage()?;
    conn.pragma_update(None, "synchronous", "FULL").storage()?;
    conn.busy_timeout(Duration::from_secs(5)).storage()?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            entity TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            sync_version TEXT,
            PRIMARY KEY (entity, id)
        );

        CREATE TABLE IF NOT EXISTS outbox (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            last_attempt_at INTEGER,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_record ON outbox(entity, record_id);

        CREATE TABLE IF NOT EXISTS conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            record_id TEXT NOT NULL,
            local_value TEXT,
            remote_value TEXT,
            resolved_value TEXT,
            strategy TEXT NOT NULL,
            detected_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_detected ON conflicts(detected_at);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
    .storage()?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .storage()?;
    Ok(())
}
