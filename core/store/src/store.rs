//! Record persistence, meta storage and change notification.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shopsync_common::{now, timestamp_from_millis, Entity, Error, Payload, Result};

use crate::conflicts::{self, ConflictLog};
use crate::model::{
    Conflict, NewConflict, Operation, Reconciled, Record, RemoteAction, RemoteChange, Resolution,
    SortOrder, SortSpec,
};
use crate::notify::{ChangeNotifier, DataChange};
use crate::outbox::{self, Outbox};
use crate::schema;
use crate::SqlResultExt;

/// Durable local store backed by a single SQLite connection.
///
/// The connection is opened once and guarded by a mutex, so every call runs
/// against a consistent snapshot and writes to the same record never
/// interleave.
pub struct LocalStore {
    conn: Mutex<Connection>,
    notifier: RwLock<Option<Arc<dyn ChangeNotifier>>>,
}

impl LocalStore {
    /// Open (or create) the store at the given path.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).storage()?;
        schema::init(&conn)?;
        info!("Local store opened at {}", path.display());
        Ok(Self::with_connection(conn))
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().storage()?;
        schema::init(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            notifier: RwLock::new(None),
        }
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Local store lock poisoned".to_string()))
    }

    /// Queue of undelivered local mutations.
    pub fn outbox(&self) -> Outbox<'_> {
        Outbox::new(self)
    }

    /// Audit log of resolved conflicts.
    pub fn conflicts(&self) -> ConflictLog<'_> {
        ConflictLog::new(self)
    }

    /// Register the single consumer of change notifications, replacing any
    /// previous one. `None` unregisters.
    pub fn set_notifier(&self, notifier: Option<Arc<dyn ChangeNotifier>>) {
        match self.notifier.write() {
            Ok(mut slot) => *slot = notifier,
            Err(poisoned) => *poisoned.into_inner() = notifier,
        }
    }

    fn emit(&self, change: &DataChange) {
        let notifier = match self.notifier.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(notifier) = notifier {
            notifier.notify(change);
        }
    }

    /// List live records of an entity.
    pub fn list_records(&self, entity: Entity, sort: &SortSpec) -> Result<Vec<Payload>> {
        let mut records = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT entity, id, payload, updated_at, deleted, sync_version
                     FROM records WHERE entity = ?1 AND deleted = 0",
                )
                .storage()?;
            let rows = stmt
                .query_map([entity.as_str()], RawRecord::from_row)
                .storage()?;

            let mut records = Vec::new();
            for raw in rows {
                records.push(raw.storage()?.into_record()?);
            }
            records
        };

        sort_records(&mut records, sort);
        Ok(records.into_iter().map(|r| r.payload).collect())
    }

    /// Get a live record's payload.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist or is tombstoned
    pub fn get_record(&self, entity: Entity, id: &str) -> Result<Payload> {
        match self.record(entity, id)? {
            Some(record) if !record.deleted => Ok(record.payload),
            _ => Err(Error::NotFound(format!("{}/{}", entity, id))),
        }
    }

    /// Get the full record, tombstones included.
    pub fn record(&self, entity: Entity, id: &str) -> Result<Option<Record>> {
        let conn = self.conn()?;
        load_record(&conn, entity, id)
    }

    /// Insert or replace a record and queue its delivery.
    ///
    /// A missing or blank `id` is generated. The record write and the outbox
    /// entry commit together or not at all.
    ///
    /// # Errors
    /// - `InvalidInput` if `id` is present but not a string
    /// - `Storage` on persistence failure
    pub fn upsert_record(&self, entity: Entity, mut payload: Payload) -> Result<Payload> {
        let id = extract_id(&payload)?.unwrap_or_else(|| Uuid::new_v4().to_string());
        payload.insert("id".to_string(), Value::String(id.clone()));
        let json = serde_json::to_string(&payload)?;
        let updated_at = now();

        {
            let mut conn = self.conn()?;
            let tx = conn.transaction().storage()?;

            let exists = tx
                .query_row(
                    "SELECT 1 FROM records WHERE entity = ?1 AND id = ?2",
                    params![entity.as_str(), id],
                    |_| Ok(()),
                )
                .optional()
                .storage()?
                .is_some();
            let operation = if exists {
                Operation::Update
            } else {
                Operation::Create
            };

            tx.execute(
                r#"
                INSERT INTO records (entity, id, payload, updated_at, deleted, sync_version)
                VALUES (?1, ?2, ?3, ?4, 0, NULL)
                ON CONFLICT(entity, id) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at,
                    deleted = 0
                "#,
                params![entity.as_str(), id, json, updated_at.timestamp_millis()],
            )
            .storage()?;

            let sequence = outbox::enqueue(&tx, entity, &id, operation, Some(&json), updated_at)?;
            tx.commit().storage()?;
            debug!("Upserted {}/{} ({} queued as #{})", entity, id, operation, sequence);
        }

        self.emit(&DataChange {
            entity,
            id,
            payload: payload.clone(),
            deleted: false,
        });
        Ok(payload)
    }

    /// Tombstone a record and queue the deletion.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist or is already deleted
    pub fn delete_record(&self, entity: Entity, id: &str) -> Result<()> {
        let updated_at = now();

        let payload = {
            let mut conn = self.conn()?;
            let tx = conn.transaction().storage()?;

            let existing = match load_record(&tx, entity, id)? {
                Some(record) if !record.deleted => record,
                _ => return Err(Error::NotFound(format!("{}/{}", entity, id))),
            };

            tx.execute(
                "UPDATE records SET deleted = 1, updated_at = ?3 WHERE entity = ?1 AND id = ?2",
                params![entity.as_str(), id, updated_at.timestamp_millis()],
            )
            .storage()?;

            let sequence = outbox::enqueue(&tx, entity, id, Operation::Delete, None, updated_at)?;
            tx.commit().storage()?;
            debug!("Deleted {}/{} (queued as #{})", entity, id, sequence);
            existing.payload
        };

        self.emit(&DataChange {
            entity,
            id: id.to_string(),
            payload,
            deleted: true,
        });
        Ok(())
    }

    /// Number of undelivered outbox entries.
    pub fn pending_count(&self) -> Result<u64> {
        self.outbox().len()
    }

    /// Most recent conflicts first.
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<Conflict>> {
        self.conflicts().list(limit)
    }

    /// Read a meta value.
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .storage()
    }

    /// Read a meta value, falling back to `default`.
    pub fn get_meta(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.meta(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Write a meta value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .storage()?;
        Ok(())
    }

    /// Record a successful remote delivery.
    ///
    /// Acknowledges `sequences`, stamps the record with the remote `version`
    /// when one is known, and purges the record if it is a tombstone with
    /// nothing left to send. Returns whether the record was purged.
    pub fn confirm_delivery(
        &self,
        entity: Entity,
        id: &str,
        sequences: &[i64],
        version: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().storage()?;

        for sequence in sequences {
            outbox::remove(&tx, *sequence)?;
        }
        if let Some(version) = version {
            set_version(&tx, entity, id, version)?;
        }

        let purged = if outbox::pending_in(&tx, entity, id)? == 0 {
            tx.execute(
                "DELETE FROM records WHERE entity = ?1 AND id = ?2 AND deleted = 1",
                params![entity.as_str(), id],
            )
            .storage()?
                > 0
        } else {
            false
        };

        tx.commit().storage()?;
        if purged {
            debug!("Purged tombstone {}/{}", entity, id);
        }
        Ok(purged)
    }

    /// Reconcile a pulled remote copy with the local record.
    ///
    /// `decide` receives the local record (tombstones included) and whether
    /// it has undelivered mutations. Reading that state, applying the action
    /// and logging any conflict happen in one transaction, so a concurrent
    /// `upsert_record` commits either before `decide` sees the record or
    /// after the remote copy is written.
    ///
    /// # Errors
    /// - `Conflict` if `decide` asks to overwrite a record with pending mutations
    /// - `Storage` on persistence failure
    pub fn reconcile_remote<F>(
        &self,
        entity: Entity,
        id: &str,
        change: &RemoteChange,
        decide: F,
    ) -> Result<Reconciled>
    where
        F: FnOnce(Option<&Record>, bool) -> RemoteAction,
    {
        let (outcome, event) = {
            let mut conn = self.conn()?;
            let tx = conn.transaction().storage()?;

            let local = load_record(&tx, entity, id)?;
            let pending = outbox::pending_in(&tx, entity, id)? > 0;

            let (outcome, event) = match decide(local.as_ref(), pending) {
                RemoteAction::Skip => return Ok(Reconciled::Skipped),
                RemoteAction::Apply if pending => {
                    return Err(Error::Conflict(format!(
                        "{}/{} has pending mutations",
                        entity, id
                    )))
                }
                RemoteAction::Apply => (Reconciled::Applied, write_remote(&tx, entity, id, change)?),
                RemoteAction::Resolve(conflict, resolution) => {
                    let (logged, event) = resolve(&tx, &conflict, &resolution)?;
                    let took_remote = matches!(resolution, Resolution::TakeRemote(_));
                    (
                        Reconciled::Resolved {
                            conflict: logged,
                            took_remote,
                        },
                        event,
                    )
                }
            };

            tx.commit().storage()?;
            (outcome, event)
        };

        if let Some(event) = event {
            self.emit(&event);
        }
        Ok(outcome)
    }
}

/// Raw `records` row before JSON and timestamp decoding.
struct RawRecord {
    entity: String,
    id: String,
    payload: String,
    updated_at: i64,
    deleted: i64,
    sync_version: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity: row.get(0)?,
            id: row.get(1)?,
            payload: row.get(2)?,
            updated_at: row.get(3)?,
            deleted: row.get(4)?,
            sync_version: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        Ok(Record {
            entity: self.entity.parse()?,
            id: self.id,
            payload: serde_json::from_str(&self.payload)?,
            updated_at: timestamp_from_millis(self.updated_at)?,
            deleted: self.deleted != 0,
            sync_version: self.sync_version,
        })
    }
}

fn load_record(conn: &Connection, entity: Entity, id: &str) -> Result<Option<Record>> {
    let raw = conn
        .query_row(
            "SELECT entity, id, payload, updated_at, deleted, sync_version
             FROM records WHERE entity = ?1 AND id = ?2",
            params![entity.as_str(), id],
            RawRecord::from_row,
        )
        .optional()
        .storage()?;
    raw.map(RawRecord::into_record).transpose()
}

fn set_version(tx: &Transaction<'_>, entity: Entity, id: &str, version: &str) -> Result<()> {
    tx.execute(
        "UPDATE records SET sync_version = ?3 WHERE entity = ?1 AND id = ?2",
        params![entity.as_str(), id, version],
    )
    .storage()?;
    Ok(())
}

/// Apply a conflict resolution and append its log entry.
fn resolve(
    tx: &Transaction<'_>,
    conflict: &NewConflict,
    resolution: &Resolution,
) -> Result<(Conflict, Option<DataChange>)> {
    let entity = conflict.entity;
    let id = conflict.record_id.as_str();

    let event = match resolution {
        Resolution::TakeRemote(change) => {
            let discarded = outbox::discard(tx, entity, id)?;
            if discarded > 0 {
                warn!(
                    "Discarded {} pending mutation(s) for {}/{} after losing conflict",
                    discarded, entity, id
                );
            }
            write_remote(tx, entity, id, change)?
        }
        Resolution::KeepLocal { version } => {
            set_version(tx, entity, id, version)?;
            None
        }
    };

    let logged = conflicts::append(tx, conflict)?;
    Ok((logged, event))
}

fn write_remote(
    tx: &Transaction<'_>,
    entity: Entity,
    id: &str,
    change: &RemoteChange,
) -> Result<Option<DataChange>> {
    let updated_at = change.updated_at.timestamp_millis();

    match &change.payload {
        Some(payload) => {
            let mut payload = payload.clone();
            payload.insert("id".to_string(), Value::String(id.to_string()));
            let json = serde_json::to_string(&payload)?;

            tx.execute(
                r#"
                INSERT INTO records (entity, id, payload, updated_at, deleted, sync_version)
                VALUES (?1, ?2, ?3, ?4, 0, ?5)
                ON CONFLICT(entity, id) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at,
                    deleted = 0,
                    sync_version = excluded.sync_version
                "#,
                params![entity.as_str(), id, json, updated_at, change.version],
            )
            .storage()?;

            Ok(Some(DataChange {
                entity,
                id: id.to_string(),
                payload,
                deleted: false,
            }))
        }
        None => {
            let Some(existing) = load_record(tx, entity, id)? else {
                return Ok(None);
            };

            if outbox::pending_in(tx, entity, id)? == 0 {
                tx.execute(
                    "DELETE FROM records WHERE entity = ?1 AND id = ?2",
                    params![entity.as_str(), id],
                )
                .storage()?;
            } else {
                tx.execute(
                    "UPDATE records SET deleted = 1, updated_at = ?3, sync_version = ?4
                     WHERE entity = ?1 AND id = ?2",
                    params![entity.as_str(), id, updated_at, change.version],
                )
                .storage()?;
            }

            if existing.deleted {
                return Ok(None);
            }
            Ok(Some(DataChange {
                entity,
                id: id.to_string(),
                payload: existing.payload,
                deleted: true,
            }))
        }
    }
}

fn extract_id(payload: &Payload) -> Result<Option<String>> {
    match payload.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if id.trim().is_empty() => Ok(None),
        Some(Value::String(id)) => Ok(Some(id.clone())),
        Some(other) => Err(Error::InvalidInput(format!(
            "Record id must be a string, got {}",
            other
        ))),
    }
}

fn sort_key(record: &Record, field: Option<&str>) -> Option<Value> {
    match field {
        None | Some("updatedAt") => Some(Value::from(record.updated_at.timestamp_millis())),
        Some("id") => Some(Value::String(record.id.clone())),
        Some(name) => record.payload.get(name).filter(|v| !v.is_null()).cloned(),
    }
}

fn sort_records(records: &mut [Record], sort: &SortSpec) {
    let field = sort.field.as_deref();
    records.sort_by(|a, b| {
        let ordering = match (sort_key(a, field), sort_key(b, field)) {
            (None, None) => Ordering::Equal,
            // Records without the field go last in either direction.
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let ordering = compare_values(&x, &y);
                match sort.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            }
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    });
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Convert a stored timestamp column.
pub(crate) fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    timestamp_from_millis(millis)
}
