//! Append-only audit log of resolved conflicts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Transaction};
use tracing::info;

use shopsync_common::{Payload, Result};

use crate::model::{Conflict, NewConflict};
use crate::store::{millis_to_time, LocalStore};
use crate::SqlResultExt;

/// View over the conflict log of a [`LocalStore`].
pub struct ConflictLog<'a> {
    store: &'a LocalStore,
}

struct RawConflict {
    id: i64,
    entity: String,
    record_id: String,
    local_value: Option<String>,
    remote_value: Option<String>,
    resolved_value: Option<String>,
    strategy: String,
    detected_at: i64,
}

impl RawConflict {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity: row.get(1)?,
            record_id: row.get(2)?,
            local_value: row.get(3)?,
            remote_value: row.get(4)?,
            resolved_value: row.get(5)?,
            strategy: row.get(6)?,
            detected_at: row.get(7)?,
        })
    }
}

impl TryFrom<RawConflict> for Conflict {
    type Error = shopsync_common::Error;

    fn try_from(raw: RawConflict) -> Result<Self> {
        Ok(Conflict {
            id: raw.id,
            entity: raw.entity.parse()?,
            record_id: raw.record_id,
            local_value: decode(raw.local_value)?,
            remote_value: decode(raw.remote_value)?,
            resolved_value: decode(raw.resolved_value)?,
            strategy: raw.strategy.parse()?,
            detected_at: millis_to_time(raw.detected_at)?,
        })
    }
}

fn decode(value: Option<String>) -> Result<Option<Payload>> {
    Ok(value.as_deref().map(serde_json::from_str).transpose()?)
}

fn encode(value: &Option<Payload>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

impl<'a> ConflictLog<'a> {
    pub(crate) fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    /// Append a conflict on its own.
    ///
    /// The engine records conflicts through
    /// [`LocalStore::reconcile_remote`] so the resolution and its log entry
    /// commit together.
    pub fn append(&self, conflict: &NewConflict) -> Result<Conflict> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction().storage()?;
        let logged = append(&tx, conflict)?;
        tx.commit().storage()?;
        Ok(logged)
    }

    /// Most recent conflicts first.
    pub fn list(&self, limit: usize) -> Result<Vec<Conflict>> {
        let conn = self.store.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, entity, record_id, local_value, remote_value, resolved_value,
                        strategy, detected_at
                 FROM conflicts ORDER BY detected_at DESC, id DESC LIMIT ?1",
            )
            .storage()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], RawConflict::from_row).storage()?;

        let mut conflicts = Vec::new();
        for raw in rows {
            conflicts.push(Conflict::try_from(raw.storage()?)?);
        }
        Ok(conflicts)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.store.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))
            .storage()?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Drop entries older than `max_age`, then keep only the newest
    /// `max_entries`. Returns the number of entries removed.
    pub fn prune(&self, max_entries: usize, max_age: Duration) -> Result<usize> {
        self.prune_at(max_entries, max_age, Utc::now())
    }

    fn prune_at(&self, max_entries: usize, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - max_age).timestamp_millis();
        let keep = i64::try_from(max_entries).unwrap_or(i64::MAX);

        let conn = self.store.conn()?;
        let expired = conn
            .execute("DELETE FROM conflicts WHERE detected_at < ?1", [cutoff])
            .storage()?;
        let overflow = conn
            .execute(
                "DELETE FROM conflicts WHERE id NOT IN (
                     SELECT id FROM conflicts ORDER BY detected_at DESC, id DESC LIMIT ?1
                 )",
                [keep],
            )
            .storage()?;

        let removed = expired + overflow;
        if removed > 0 {
            info!("Pruned {} conflict log entries", removed);
        }
        Ok(removed)
    }
}

/// Insert a conflict inside the caller's transaction.
pub(crate) fn append(tx: &Transaction<'_>, conflict: &NewConflict) -> Result<Conflict> {
    tx.execute(
        "INSERT INTO conflicts
             (entity, record_id, local_value, remote_value, resolved_value, strategy, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conflict.entity.as_str(),
            conflict.record_id,
            encode(&conflict.local_value)?,
            encode(&conflict.remote_value)?,
            encode(&conflict.resolved_value)?,
            conflict.strategy.as_str(),
            conflict.detected_at.timestamp_millis(),
        ],
    )
    .storage()?;

    Ok(Conflict {
        id: tx.last_insert_rowid(),
        entity: conflict.entity,
        record_id: conflict.record_id.clone(),
        local_value: conflict.local_value.clone(),
        remote_value: conflict.remote_value.clone(),
        resolved_value: conflict.resolved_value.clone(),
        strategy: conflict.strategy,
        detected_at: conflict.detected_at,
    })
}
