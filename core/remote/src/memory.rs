//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use shopsync_common::{now, Entity, Error, Payload, Result};

use crate::provider::{RemoteDocument, RemoteStore};
use crate::session::RemoteSession;

#[derive(Debug, Clone)]
struct StoredDocument {
    payload: Payload,
    updated_at: DateTime<Utc>,
    synced_at: DateTime<Utc>,
    version: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    documents: HashMap<(Entity, String), StoredDocument>,
    next_version: u64,
    clock: Option<DateTime<Utc>>,
    writes: u64,
    calls: u64,
    rate_limit: Option<(u64, u64)>,
    failing_ids: HashSet<String>,
    offline: bool,
    require_auth: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.next_version += 1;
        format!("v{}", self.next_version)
    }

    /// Server time for the next write, strictly increasing even when the
    /// wall clock stalls or steps back.
    fn tick(&mut self) -> DateTime<Utc> {
        let wall = now();
        let stamp = match self.clock {
            Some(last) if wall <= last => last + Duration::milliseconds(1),
            _ => wall,
        };
        self.clock = Some(stamp);
        stamp
    }

    fn live(&self, entity: Entity, id: &str) -> Option<&StoredDocument> {
        self.documents
            .get(&(entity, id.to_string()))
            .filter(|doc| !doc.deleted)
    }
}

/// In-memory remote store.
///
/// Useful for tests and demos. Versions are `v1`, `v2`, ... from a single
/// counter and every write is stamped from a monotonic millisecond clock.
/// Faults can be injected to exercise the engine's error paths.
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject calls without an auth token.
    pub fn require_auth(&self, required: bool) {
        self.state().require_auth = required;
    }

    /// Fail every call with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Accept `writes` more successful writes, then answer every write with
    /// `RateLimited`.
    pub fn rate_limit_after(&self, writes: u64, retry_after_ms: u64) {
        let mut state = self.state();
        let limit = state.writes + writes;
        state.rate_limit = Some((limit, retry_after_ms));
    }

    pub fn clear_rate_limit(&self) {
        self.state().rate_limit = None;
    }

    /// Fail writes to `id` with a network error.
    pub fn fail_id(&self, id: impl Into<String>) {
        self.state().failing_ids.insert(id.into());
    }

    pub fn clear_failures(&self) {
        self.state().failing_ids.clear();
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }

    /// Calls received so far, reads included.
    pub fn call_count(&self) -> u64 {
        self.state().calls
    }

    /// Write a document directly, as another replica would. Not counted as a
    /// write and never faulted. Returns the new version.
    pub fn put_document(
        &self,
        entity: Entity,
        id: &str,
        payload: Payload,
        updated_at: DateTime<Utc>,
    ) -> String {
        let mut state = self.state();
        let version = state.next_version();
        let synced_at = state.tick();
        state.documents.insert(
            (entity, id.to_string()),
            StoredDocument {
                payload: with_id(payload, id),
                updated_at,
                synced_at,
                version: version.clone(),
                deleted: false,
            },
        );
        version
    }

    /// Tombstone a document directly, as another replica would.
    pub fn tombstone_document(&self, entity: Entity, id: &str, updated_at: DateTime<Utc>) -> String {
        let mut state = self.state();
        let version = state.next_version();
        let synced_at = state.tick();
        state.documents.insert(
            (entity, id.to_string()),
            StoredDocument {
                payload: Payload::new(),
                updated_at,
                synced_at,
                version: version.clone(),
                deleted: true,
            },
        );
        version
    }

    /// Inspect a document, tombstones included.
    pub fn document(&self, entity: Entity, id: &str) -> Option<RemoteDocument> {
        self.state()
            .documents
            .get(&(entity, id.to_string()))
            .map(|doc| to_remote(id, doc))
    }

    /// Live documents of an entity, ordered by id.
    pub fn documents(&self, entity: Entity) -> Vec<RemoteDocument> {
        let state = self.state();
        let mut docs: Vec<_> = state
            .documents
            .iter()
            .filter(|((e, _), doc)| *e == entity && !doc.deleted)
            .map(|((_, id), doc)| to_remote(id, doc))
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    fn check_call(&self, state: &mut State, session: &RemoteSession) -> Result<()> {
        state.calls += 1;
        if state.offline {
            return Err(Error::Network("Remote unreachable".to_string()));
        }
        if state.require_auth {
            session.require_token()?;
        }
        Ok(())
    }

    fn check_write(&self, state: &mut State, session: &RemoteSession, id: &str) -> Result<()> {
        self.check_call(state, session)?;
        if state.failing_ids.contains(id) {
            return Err(Error::Network(format!("Injected failure for {}", id)));
        }
        if let Some((limit, retry_after_ms)) = state.rate_limit {
            if state.writes >= limit {
                return Err(Error::RateLimited { retry_after_ms });
            }
        }
        Ok(())
    }

    fn store(
        state: &mut State,
        entity: Entity,
        id: &str,
        payload: Payload,
        updated_at: DateTime<Utc>,
        deleted: bool,
    ) -> String {
        let version = state.next_version();
        let synced_at = state.tick();
        state.writes += 1;
        state.documents.insert(
            (entity, id.to_string()),
            StoredDocument {
                payload,
                updated_at,
                synced_at,
                version: version.clone(),
                deleted,
            },
        );
        version
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn with_id(mut payload: Payload, id: &str) -> Payload {
    payload.insert("id".to_string(), serde_json::Value::String(id.to_string()));
    payload
}

fn to_remote(id: &str, doc: &StoredDocument) -> RemoteDocument {
    RemoteDocument {
        id: id.to_string(),
        payload: doc.payload.clone(),
        updated_at: doc.updated_at,
        synced_at: doc.synced_at,
        version: doc.version.clone(),
        deleted: doc.deleted,
    }
}

fn check_version(doc: &StoredDocument, expected: Option<&str>, entity: Entity, id: &str) -> Result<()> {
    match expected {
        Some(expected) if expected != doc.version => Err(Error::Conflict(format!(
            "{}/{} is at {}, expected {}",
            entity, id, doc.version, expected
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut state = self.state();
        self.check_write(&mut state, session, id)?;

        if state.live(entity, id).is_some() {
            return Err(Error::Conflict(format!("{}/{} already exists", entity, id)));
        }

        let version = Self::store(
            &mut state,
            entity,
            id,
            with_id(payload.clone(), id),
            updated_at,
            false,
        );
        debug!("memory: created {}/{} at {}", entity, id, version);
        Ok(version)
    }

    async fn update(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        self.check_write(&mut state, session, id)?;

        let current = state
            .live(entity, id)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", entity, id)))?;
        check_version(current, expected_version, entity, id)?;

        let version = Self::store(
            &mut state,
            entity,
            id,
            with_id(payload.clone(), id),
            updated_at,
            false,
        );
        debug!("memory: updated {}/{} to {}", entity, id, version);
        Ok(version)
    }

    async fn delete(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        self.check_write(&mut state, session, id)?;

        let current = state
            .live(entity, id)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", entity, id)))?;
        check_version(current, expected_version, entity, id)?;

        let version = Self::store(&mut state, entity, id, Payload::new(), updated_at, true);
        debug!("memory: tombstoned {}/{} at {}", entity, id, version);
        Ok(version)
    }

    async fn get(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
    ) -> Result<Option<RemoteDocument>> {
        let mut state = self.state();
        self.check_call(&mut state, session)?;
        Ok(state
            .documents
            .get(&(entity, id.to_string()))
            .map(|doc| to_remote(id, doc)))
    }

    async fn changed_since(
        &self,
        session: &RemoteSession,
        entity: Entity,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteDocument>> {
        let mut state = self.state();
        self.check_call(&mut state, session)?;

        let mut docs: Vec<_> = state
            .documents
            .iter()
            .filter(|((e, _), doc)| *e == entity && cursor.map_or(true, |c| doc.synced_at >= c))
            .map(|((_, id), doc)| to_remote(id, doc))
            .collect();
        docs.sort_by(|a, b| a.synced_at.cmp(&b.synced_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shopsync_common::AuthToken;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn session() -> RemoteSession {
        RemoteSession::default()
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let remote = MemoryRemote::new();
        let s = session();
        let now = Utc::now();

        let v1 = remote
            .create(&s, Entity::Products, "p1", &payload(json!({"stock": 5})), now)
            .await
            .unwrap();
        let v2 = remote
            .update(&s, Entity::Products, "p1", &payload(json!({"stock": 3})), now, Some(&v1))
            .await
            .unwrap();
        assert_ne!(v1, v2);

        let doc = remote.get(&s, Entity::Products, "p1").await.unwrap().unwrap();
        assert_eq!(doc.payload["stock"], 3);
        assert_eq!(doc.payload["id"], "p1");

        remote
            .delete(&s, Entity::Products, "p1", now, Some(&v2))
            .await
            .unwrap();
        let doc = remote.get(&s, Entity::Products, "p1").await.unwrap().unwrap();
        assert!(doc.deleted);
        assert!(remote.documents(Entity::Products).is_empty());
        assert_eq!(remote.write_count(), 3);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let remote = MemoryRemote::new();
        let s = session();
        let now = Utc::now();
        let body = payload(json!({"name": "Ada"}));

        remote.create(&s, Entity::Customers, "c1", &body, now).await.unwrap();
        assert!(matches!(
            remote.create(&s, Entity::Customers, "c1", &body, now).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            remote
                .update(&s, Entity::Customers, "c1", &body, now, Some("v999"))
                .await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            remote.update(&s, Entity::Customers, "c2", &body, now, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_over_tombstone() {
        let remote = MemoryRemote::new();
        let s = session();
        let now = Utc::now();
        remote.tombstone_document(Entity::Orders, "o1", now);

        assert!(matches!(
            remote
                .update(&s, Entity::Orders, "o1", &Payload::new(), now, None)
                .await,
            Err(Error::NotFound(_))
        ));
        remote
            .create(&s, Entity::Orders, "o1", &payload(json!({"total": 10})), now)
            .await
            .unwrap();
        assert_eq!(remote.documents(Entity::Orders).len(), 1);
    }

    #[tokio::test]
    async fn test_changed_since_follows_commit_order() {
        let remote = MemoryRemote::new();
        let s = session();
        let base = Utc::now();

        remote.put_document(Entity::Products, "b", Payload::new(), base + Duration::seconds(2));
        remote.put_document(Entity::Products, "a", Payload::new(), base);
        remote.tombstone_document(Entity::Products, "c", base + Duration::seconds(1));

        let all = remote.changed_since(&s, Entity::Products, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(all.windows(2).all(|w| w[0].synced_at < w[1].synced_at));

        // Inclusive of the cursor itself.
        let later = remote
            .changed_since(&s, Entity::Products, Some(all[1].synced_at))
            .await
            .unwrap();
        let ids: Vec<_> = later.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(later[1].deleted);
    }

    #[tokio::test]
    async fn test_late_write_with_old_timestamp_is_still_returned() {
        let remote = MemoryRemote::new();
        let s = session();
        let stale = Utc::now() - Duration::hours(1);

        remote.put_document(Entity::Orders, "o1", Payload::new(), Utc::now());
        let cursor = remote
            .changed_since(&s, Entity::Orders, None)
            .await
            .unwrap()
            .iter()
            .map(|d| d.synced_at)
            .max();

        remote
            .create(&s, Entity::Orders, "o2", &payload(json!({"total": 7})), stale)
            .await
            .unwrap();

        let changed = remote.changed_since(&s, Entity::Orders, cursor).await.unwrap();
        let doc = changed.iter().find(|d| d.id == "o2").unwrap();
        assert_eq!(doc.updated_at, stale);
        assert!(doc.synced_at >= cursor.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_after_writes() {
        let remote = MemoryRemote::new();
        let s = session();
        remote.rate_limit_after(2, 1500);

        for id in ["a", "b"] {
            remote
                .create(&s, Entity::Products, id, &Payload::new(), Utc::now())
                .await
                .unwrap();
        }
        let err = remote
            .create(&s, Entity::Products, "c", &Payload::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_ms: 1500 }));
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn test_faults() {
        let remote = MemoryRemote::new();
        remote.require_auth(true);

        let err = remote
            .get(&session(), Entity::Settings, "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        let authed = RemoteSession::new(Some(AuthToken::new("t").unwrap()), None);
        assert!(remote.get(&authed, Entity::Settings, "s1").await.unwrap().is_none());

        remote.fail_id("s1");
        let err = remote
            .create(&authed, Entity::Settings, "s1", &Payload::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        remote.set_offline(true);
        assert!(matches!(
            remote.get(&authed, Entity::Settings, "s2").await,
            Err(Error::Network(_))
        ));
        assert_eq!(remote.call_count(), 4);
    }
}
