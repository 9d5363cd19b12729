//! Remote store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopsync_common::{Entity, Payload, Result};

use crate::session::RemoteSession;

/// A document as held by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: String,
    /// Business fields. Empty for tombstones.
    pub payload: Payload,
    /// Writer-supplied modification time, compared for last-writer-wins.
    pub updated_at: DateTime<Utc>,
    /// Time the remote accepted the write. Assigned by the remote and
    /// non-decreasing in commit order, so it is safe to page pulls on.
    pub synced_at: DateTime<Utc>,
    /// Opaque version token, changes on every write.
    pub version: String,
    /// Remote tombstone left by a deletion.
    pub deleted: bool,
}

impl RemoteDocument {
    /// Payload for live documents, `None` for tombstones.
    pub fn live_payload(&self) -> Option<&Payload> {
        (!self.deleted).then_some(&self.payload)
    }
}

/// Remote document store, partitioned by tenant and entity.
///
/// Every method receives the session captured at the start of a sync run.
/// Implementations must map their failures onto:
/// - `Network` for transport failures and unexpected responses
/// - `RateLimited` when the backend asks the client to slow down
/// - `Authentication` for missing or rejected credentials
/// - `Conflict` when a version precondition does not hold
/// - `NotFound` when the document is absent
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logging (e.g. "memory", "firestore").
    fn name(&self) -> &str;

    /// Create a document.
    ///
    /// A remote tombstone counts as absent and is overwritten.
    ///
    /// # Errors
    /// - `Conflict` if a live document with this id exists
    async fn create(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
    ) -> Result<String>;

    /// Replace a document's payload.
    ///
    /// # Errors
    /// - `NotFound` if the document is absent or tombstoned
    /// - `Conflict` if `expected_version` is given and differs
    async fn update(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String>;

    /// Tombstone a document so other replicas observe the deletion.
    ///
    /// # Errors
    /// - `NotFound` if the document is absent or already tombstoned
    /// - `Conflict` if `expected_version` is given and differs
    async fn delete(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String>;

    /// Fetch one document, tombstones included.
    async fn get(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
    ) -> Result<Option<RemoteDocument>>;

    /// Documents with `synced_at >= cursor` (all when `None`) in commit
    /// order, tombstones included.
    ///
    /// The cursor is compared against `synced_at`, never the writer's
    /// `updated_at`, which may lag far behind for edits delivered late.
    async fn changed_since(
        &self,
        session: &RemoteSession,
        entity: Entity,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteDocument>>;
}
