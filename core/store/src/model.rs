//! Persisted data model: records, outbox entries and conflicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use shopsync_common::{Entity, Error, Payload, Result};

/// A unit of persisted business data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub entity: Entity,
    pub id: String,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    /// Remote version seen on the last successful pull or push.
    pub sync_version: Option<String>,
}

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::Storage(format!("Unknown outbox operation: {}", other))),
        }
    }
}

/// One queued local mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Strictly increasing replay position.
    pub sequence: i64,
    pub entity: Entity,
    #[serde(rename = "id")]
    pub record_id: String,
    pub operation: Operation,
    /// Snapshot of the record at enqueue time; absent for deletes.
    pub payload: Option<Payload>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Conflict resolution rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// Later `updatedAt` wins; ties go to the remote value.
    #[default]
    LastWriterWins,
    /// Remote value always wins.
    PreferRemote,
    /// Local value always wins.
    PreferLocal,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriterWins => "lastWriterWins",
            ConflictStrategy::PreferRemote => "preferRemote",
            ConflictStrategy::PreferLocal => "preferLocal",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lastWriterWins" => Ok(ConflictStrategy::LastWriterWins),
            "preferRemote" => Ok(ConflictStrategy::PreferRemote),
            "preferLocal" => Ok(ConflictStrategy::PreferLocal),
            other => Err(Error::InvalidInput(format!("Unknown conflict strategy: {}", other))),
        }
    }
}

/// A conflict about to be written to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub entity: Entity,
    pub record_id: String,
    /// `None` when the local side was a deletion.
    pub local_value: Option<Payload>,
    /// `None` when the remote side was a deletion.
    pub remote_value: Option<Payload>,
    pub resolved_value: Option<Payload>,
    pub strategy: ConflictStrategy,
    pub detected_at: DateTime<Utc>,
}

/// A logged divergence between local and remote versions of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: i64,
    pub entity: Entity,
    pub record_id: String,
    pub local_value: Option<Payload>,
    pub remote_value: Option<Payload>,
    pub resolved_value: Option<Payload>,
    pub strategy: ConflictStrategy,
    pub detected_at: DateTime<Utc>,
}

/// Remote state of a record to be written locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// `None` when the remote copy is a tombstone.
    pub payload: Option<Payload>,
    pub updated_at: DateTime<Utc>,
    pub version: String,
}

/// Outcome of a resolved conflict, applied atomically with its log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Overwrite local with the remote copy and discard pending local mutations.
    TakeRemote(RemoteChange),
    /// Keep the local payload; adopt the remote version as the new base so the
    /// queued mutations overwrite it on the next push.
    KeepLocal { version: String },
}

/// What to do with a pulled remote copy, decided against the local record as
/// it stands inside the applying transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAction {
    /// Leave the local copy alone.
    Skip,
    /// Overwrite the local copy. Refused while mutations are pending.
    Apply,
    /// Settle a conflict with pending mutations and log it.
    Resolve(NewConflict, Resolution),
}

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Skipped,
    Applied,
    Resolved { conflict: Conflict, took_remote: bool },
}

/// Sort direction for record listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            other => Err(Error::InvalidInput(format!("Unknown sort order: {}", other))),
        }
    }
}

/// How to order a record listing.
///
/// `field` is a payload field name; `id` and `updatedAt` address the record
/// columns. No field means `updatedAt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: Option<String>,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn new(field: Option<String>, order: Option<SortOrder>) -> Self {
        let order = match (&field, order) {
            (_, Some(order)) => order,
            (Some(_), None) => SortOrder::Asc,
            (None, None) => SortOrder::Desc,
        };
        Self { field, order }
    }

    pub fn by(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: Some(field.into()),
            order,
        }
    }
}
