//! Durable FIFO of local mutations awaiting delivery.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use tracing::debug;

use shopsync_common::{now, Entity, Payload, Result};

use crate::model::{Operation, OutboxEntry};
use crate::store::{millis_to_time, LocalStore};
use crate::SqlResultExt;

/// View over the outbox table of a [`LocalStore`].
pub struct Outbox<'a> {
    store: &'a LocalStore,
}

struct RawEntry {
    sequence: i64,
    entity: String,
    record_id: String,
    operation: String,
    payload: Option<String>,
    attempts: i64,
    enqueued_at: i64,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            entity: row.get(1)?,
            record_id: row.get(2)?,
            operation: row.get(3)?,
            payload: row.get(4)?,
            attempts: row.get(5)?,
            enqueued_at: row.get(6)?,
            last_attempt_at: row.get(7)?,
            last_error: row.get(8)?,
        })
    }
}

impl TryFrom<RawEntry> for OutboxEntry {
    type Error = shopsync_common::Error;

    fn try_from(raw: RawEntry) -> Result<Self> {
        let payload = raw
            .payload
            .as_deref()
            .map(serde_json::from_str::<Payload>)
            .transpose()?;

        Ok(OutboxEntry {
            sequence: raw.sequence,
            entity: raw.entity.parse()?,
            record_id: raw.record_id,
            operation: raw.operation.parse()?,
            payload,
            attempts: u32::try_from(raw.attempts).unwrap_or(u32::MAX),
            enqueued_at: millis_to_time(raw.enqueued_at)?,
            last_attempt_at: raw.last_attempt_at.map(millis_to_time).transpose()?,
            last_error: raw.last_error,
        })
    }
}

const ENTRY_COLUMNS: &str = "sequence, entity, record_id, operation, payload, attempts, \
                             enqueued_at, last_attempt_at, last_error";

impl<'a> Outbox<'a> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    /// Oldest entries first, at most `limit`.
    pub fn drain(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM outbox ORDER BY sequence ASC LIMIT ?1",
            ENTRY_COLUMNS
        );
        query_entries(&conn, &sql, params![limit_param(limit)])
    }

    /// Remove a delivered entry. Unknown sequences are ignored.
    pub fn acknowledge(&self, sequence: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute("DELETE FROM outbox WHERE sequence = ?1", [sequence])
            .storage()?;
        Ok(())
    }

    /// Record a failed delivery attempt.
    pub fn mark_attempt(&self, sequence: i64, error: &str) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_attempt_at = ?2, last_error = ?3
             WHERE sequence = ?1",
            params![sequence, now().timestamp_millis(), error],
        )
        .storage()?;
        Ok(())
    }

    /// Clear attempt counters so every entry is retried immediately.
    /// Returns the number of entries reset.
    pub fn reset_attempts(&self) -> Result<usize> {
        let conn = self.store.conn()?;
        let reset = conn
            .execute(
                "UPDATE outbox SET attempts = 0, last_attempt_at = NULL, last_error = NULL
                 WHERE attempts > 0",
                [],
            )
            .storage()?;
        if reset > 0 {
            debug!("Reset attempts on {} outbox entries", reset);
        }
        Ok(reset)
    }

    /// Number of entries that have failed at least `max_attempts` times.
    pub fn exhausted(&self, max_attempts: u32) -> Result<u64> {
        let conn = self.store.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM outbox WHERE attempts >= ?1",
                [i64::from(max_attempts)],
                |row| row.get(0),
            )
            .storage()?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Number of queued entries.
    pub fn len(&self) -> Result<u64> {
        let conn = self.store.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .storage()?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(sql).storage()?;
    let rows = stmt.query_map(params, RawEntry::from_row).storage()?;

    let mut entries = Vec::new();
    for raw in rows {
        entries.push(OutboxEntry::try_from(raw.storage()?)?);
    }
    Ok(entries)
}

/// Append an entry inside the caller's transaction. Returns its sequence.
pub(crate) fn enqueue(
    tx: &Transaction<'_>,
    entity: Entity,
    id: &str,
    operation: Operation,
    payload: Option<&str>,
    enqueued_at: DateTime<Utc>,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO outbox (entity, record_id, operation, payload, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity.as_str(),
            id,
            operation.as_str(),
            payload,
            enqueued_at.timestamp_millis()
        ],
    )
    .storage()?;
    Ok(tx.last_insert_rowid())
}

pub(crate) fn remove(tx: &Transaction<'_>, sequence: i64) -> Result<()> {
    tx.execute("DELETE FROM outbox WHERE sequence = ?1", [sequence])
        .storage()?;
    Ok(())
}

/// Drop every queued entry for a record. Returns how many were dropped.
pub(crate) fn discard(tx: &Transaction<'_>, entity: Entity, id: &str) -> Result<usize> {
    tx.execute(
        "DELETE FROM outbox WHERE entity = ?1 AND record_id = ?2",
        params![entity.as_str(), id],
    )
    .storage()
}

pub(crate) fn pending_in(conn: &Connection, entity: Entity, id: &str) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM outbox WHERE entity = ?1 AND record_id = ?2",
            params![entity.as_str(), id],
            |row| row.get(0),
        )
        .storage()?;
    Ok(u64::try_from(count).unwrap_or(0))
}
