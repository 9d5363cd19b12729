use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use shopsync_common::{now, Entity, Payload, Result};
use shopsync_remote::{MemoryRemote, RemoteDocument, RemoteSession, RemoteStore};
use shopsync_store::{Conflict, LocalStore, SortSpec};
use shopsync_sync::{
    RetryPolicy, SkipReason, SyncConfig, SyncEngine, SyncObserver, SyncState, SyncStatus,
};

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::immediate(),
        ..SyncConfig::default()
    }
}

fn device(remote: Arc<dyn RemoteStore>) -> (Arc<LocalStore>, Arc<SyncEngine>) {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let engine = Arc::new(SyncEngine::new(Arc::clone(&store), remote, test_config()).unwrap());
    (store, engine)
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<SyncState>>,
    conflicts: Mutex<Vec<Conflict>>,
}

impl SyncObserver for Recorder {
    fn on_state_change(&self, state: &SyncState) {
        self.states.lock().unwrap().push(state.clone());
    }

    fn on_conflict_detected(&self, conflict: &Conflict) {
        self.conflicts.lock().unwrap().push(conflict.clone());
    }
}

type PullAction = Box<dyn FnOnce() + Send>;

/// Delegates to a memory remote, pausing on every pull and optionally running
/// a one-shot action once a pull has fetched its documents.
struct PullHookRemote {
    inner: Arc<MemoryRemote>,
    delay: Duration,
    after_pull: Mutex<Option<PullAction>>,
}

impl PullHookRemote {
    fn new(inner: Arc<MemoryRemote>) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            after_pull: Mutex::new(None),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn after_next_pull(&self, action: impl FnOnce() + Send + 'static) {
        *self.after_pull.lock().unwrap() = Some(Box::new(action));
    }
}

#[async_trait]
impl RemoteStore for PullHookRemote {
    fn name(&self) -> &str {
        "hooked"
    }

    async fn create(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
    ) -> Result<String> {
        self.inner
            .create(session, entity, id, payload, updated_at)
            .await
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
        self.inner
            .update(session, entity, id, payload, updated_at, expected_version)
            .await
    }

    async fn delete(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String> {
        self.inner
            .delete(session, entity, id, updated_at, expected_version)
            .await
    }

    async fn get(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
    ) -> Result<Option<RemoteDocument>> {
        self.inner.get(session, entity, id).await
    }

    async fn changed_since(
        &self,
        session: &RemoteSession,
        entity: Entity,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteDocument>> {
        tokio::time::sleep(self.delay).await;
        let documents = self.inner.changed_since(session, entity, cursor).await?;
        let action = self.after_pull.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
        Ok(documents)
    }
}

#[tokio::test]
async fn test_offline_mode_never_touches_network() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());

    engine.set_offline_mode(true).unwrap();
    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "stock": 5})))
        .unwrap();

    let result = engine.sync_once().await;
    assert!(result.skipped);
    assert_eq!(result.skip_reason, Some(SkipReason::OfflineMode));
    assert_eq!(remote.call_count(), 0);
    assert_eq!(store.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn test_host_offline_skips_run() {
    let remote = Arc::new(MemoryRemote::new());
    let (_store, engine) = device(remote.clone());

    engine.set_online_status(false);
    let result = engine.sync_once().await;
    assert_eq!(result.skip_reason, Some(SkipReason::Offline));
    assert_eq!(remote.call_count(), 0);

    engine.set_online_status(true);
    let result = engine.sync_once().await;
    assert!(!result.skipped);
}

#[tokio::test]
async fn test_second_device_receives_without_conflict() {
    let remote = Arc::new(MemoryRemote::new());
    let (store_a, engine_a) = device(remote.clone());
    let (store_b, engine_b) = device(remote.clone());

    let written = store_a
        .upsert_record(
            Entity::Customers,
            payload(json!({"id": "c1", "name": "Ada", "email": "ada@example.com"})),
        )
        .unwrap();

    let pushed = engine_a.sync_once().await;
    assert_eq!(pushed.pushed, 1);
    assert_eq!(pushed.conflicts, 0);
    assert_eq!(store_a.pending_count().unwrap(), 0);

    let pulled = engine_b.sync_once().await;
    assert_eq!(pulled.pulled, 1);
    assert_eq!(pulled.conflicts, 0);
    assert_eq!(store_b.get_record(Entity::Customers, "c1").unwrap(), written);
    assert!(store_b.list_conflicts(10).unwrap().is_empty());

    // Nothing new on either side.
    let again = engine_a.sync_once().await;
    assert_eq!((again.pushed, again.pulled, again.conflicts), (0, 0, 0));
}

#[tokio::test]
async fn test_later_remote_write_wins() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());
    let recorder = Arc::new(Recorder::default());
    engine.configure_events(recorder.clone());

    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "name": "A"})))
        .unwrap();
    let later = now() + ChronoDuration::minutes(5);
    remote.put_document(
        Entity::Products,
        "p1",
        payload(json!({"id": "p1", "name": "B"})),
        later,
    );

    let result = engine.sync_once().await;
    assert_eq!(result.conflicts, 1);
    assert_eq!(result.pushed, 0);

    let conflicts = store.list_conflicts(10).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.local_value.as_ref().unwrap()["name"], "A");
    assert_eq!(conflict.remote_value.as_ref().unwrap()["name"], "B");
    assert_eq!(conflict.resolved_value.as_ref().unwrap()["name"], "B");

    assert_eq!(store.get_record(Entity::Products, "p1").unwrap()["name"], "B");
    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(recorder.conflicts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_later_local_write_is_pushed_after_conflict() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());

    let earlier = now() - ChronoDuration::minutes(5);
    remote.put_document(
        Entity::Products,
        "p1",
        payload(json!({"id": "p1", "name": "B"})),
        earlier,
    );
    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "name": "A"})))
        .unwrap();

    let first = engine.sync_once().await;
    assert_eq!(first.conflicts, 1);
    assert_eq!(store.pending_count().unwrap(), 1);

    // The kept local edit now targets the remote version it beat.
    let second = engine.sync_once().await;
    assert_eq!(second.pushed, 1);
    assert_eq!(second.conflicts, 0);
    assert_eq!(
        remote.document(Entity::Products, "p1").unwrap().payload["name"],
        "A"
    );
}

#[tokio::test]
async fn test_late_offline_edit_reaches_device_that_synced_since() {
    let remote = Arc::new(MemoryRemote::new());
    let (store_a, engine_a) = device(remote.clone());
    let (store_b, engine_b) = device(remote.clone());

    // B edits while offline, then A writes and syncs a newer record.
    engine_b.set_offline_mode(true).unwrap();
    store_b
        .upsert_record(Entity::Products, payload(json!({"id": "y", "name": "Late"})))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    store_a
        .upsert_record(Entity::Products, payload(json!({"id": "x", "name": "Early"})))
        .unwrap();
    assert_eq!(engine_a.sync_once().await.pushed, 1);

    engine_b.set_offline_mode(false).unwrap();
    let delivered = engine_b.sync_once().await;
    assert_eq!(delivered.pushed, 1);
    assert_eq!(delivered.pulled, 1);
    let stored = remote.document(Entity::Products, "y").unwrap();
    assert!(stored.updated_at < remote.document(Entity::Products, "x").unwrap().updated_at);

    let caught_up = engine_a.sync_once().await;
    assert_eq!(caught_up.pulled, 1);
    assert_eq!(store_a.get_record(Entity::Products, "y").unwrap()["name"], "Late");

    let settled = engine_a.sync_once().await;
    assert_eq!((settled.pushed, settled.pulled, settled.conflicts), (0, 0, 0));
}

#[tokio::test]
async fn test_edit_landing_during_pull_is_kept_and_pushed() {
    let shared = Arc::new(MemoryRemote::new());
    let hooked = Arc::new(PullHookRemote::new(shared.clone()));
    let (store_a, engine_a) = device(shared.clone());
    let (store_b, engine_b) = device(hooked.clone());

    store_a
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "stock": 5})))
        .unwrap();
    engine_a.sync_once().await;
    engine_b.sync_once().await;
    assert_eq!(store_b.get_record(Entity::Products, "p1").unwrap()["stock"], 5);

    store_a
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "stock": 1})))
        .unwrap();
    assert_eq!(engine_a.sync_once().await.pushed, 1);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // The user saves on B after the pull fetched A's write but before it is applied.
    let editor = Arc::clone(&store_b);
    hooked.after_next_pull(move || {
        editor
            .upsert_record(Entity::Products, payload(json!({"id": "p1", "stock": 9})))
            .unwrap();
    });

    let during = engine_b.sync_once().await;
    assert_eq!(during.conflicts, 1);
    assert_eq!(store_b.get_record(Entity::Products, "p1").unwrap()["stock"], 9);
    assert_eq!(store_b.pending_count().unwrap(), 1);

    let after = engine_b.sync_once().await;
    assert_eq!(after.pushed, 1);
    assert_eq!(store_b.pending_count().unwrap(), 0);
    assert_eq!(
        shared.document(Entity::Products, "p1").unwrap().payload["stock"],
        9
    );

    engine_a.sync_once().await;
    assert_eq!(store_a.get_record(Entity::Products, "p1").unwrap()["stock"], 9);
}

#[tokio::test]
async fn test_overlapping_runs_execute_once() {
    let remote: Arc<dyn RemoteStore> = Arc::new(
        PullHookRemote::new(Arc::new(MemoryRemote::new())).with_delay(Duration::from_millis(50)),
    );
    let (_store, engine) = device(remote);

    let (first, second) = tokio::join!(engine.sync_once(), engine.sync_once());
    assert!(!first.skipped);
    assert!(second.skipped);
    assert_eq!(second.skip_reason, Some(SkipReason::InProgress));
}

#[tokio::test]
async fn test_rate_limit_stops_push() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());

    for i in 0..10 {
        store
            .upsert_record(
                Entity::Orders,
                payload(json!({"id": format!("o{}", i), "total": i})),
            )
            .unwrap();
    }
    remote.rate_limit_after(3, 60_000);

    let result = engine.sync_once().await;
    assert!(result.rate_limited);
    assert_eq!(result.retry_after_ms, Some(60_000));
    assert_eq!(result.pushed, 3);
    assert_eq!(store.pending_count().unwrap(), 7);
    assert_eq!(engine.sync_state().status, SyncStatus::Idle);

    // Still inside the window.
    remote.clear_rate_limit();
    let waiting = engine.sync_once().await;
    assert!(waiting.skipped && waiting.rate_limited);
    assert_eq!(store.pending_count().unwrap(), 7);

    engine.retry_failed().unwrap();
    let resumed = engine.sync_once().await;
    assert_eq!(resumed.pushed, 7);
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_offline_edits_collapse_to_one_write() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());

    engine.set_offline_mode(true).unwrap();
    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "stock": 5})))
        .unwrap();
    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1", "stock": 3})))
        .unwrap();
    assert_eq!(store.pending_count().unwrap(), 2);

    engine.set_offline_mode(false).unwrap();
    let result = engine.sync_once().await;
    assert_eq!(result.pushed, 1);
    assert_eq!(remote.write_count(), 1);
    assert_eq!(
        remote.document(Entity::Products, "p1").unwrap().payload["stock"],
        3
    );
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_delete_propagates_as_tombstone() {
    let remote = Arc::new(MemoryRemote::new());
    let (store_a, engine_a) = device(remote.clone());
    let (store_b, engine_b) = device(remote.clone());

    store_a
        .upsert_record(Entity::Settings, payload(json!({"id": "currency", "value": "EUR"})))
        .unwrap();
    engine_a.sync_once().await;
    engine_b.sync_once().await;
    assert!(store_b.get_record(Entity::Settings, "currency").is_ok());

    store_a.delete_record(Entity::Settings, "currency").unwrap();
    let result = engine_a.sync_once().await;
    assert_eq!(result.pushed, 1);
    assert!(remote.document(Entity::Settings, "currency").unwrap().deleted);
    // Delivered tombstones are purged locally.
    assert!(store_a.record(Entity::Settings, "currency").unwrap().is_none());

    engine_b.sync_once().await;
    assert!(store_b.get_record(Entity::Settings, "currency").is_err());
    assert!(store_b
        .list_records(Entity::Settings, &SortSpec::default())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_missing_token_fails_run() {
    let remote = Arc::new(MemoryRemote::new());
    remote.require_auth(true);
    let (store, engine) = device(remote.clone());
    let recorder = Arc::new(Recorder::default());
    engine.configure_events(recorder.clone());

    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1"})))
        .unwrap();

    let result = engine.sync_once().await;
    assert!(result.error.is_some());
    let state = engine.sync_state();
    assert_eq!(state.status, SyncStatus::Error);
    assert!(state.last_error.is_some());
    assert_eq!(state.pending_count, 1);

    let statuses: Vec<_> = recorder
        .states
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(statuses, vec![SyncStatus::Syncing, SyncStatus::Error]);

    engine.set_auth_token(Some("token".to_string())).unwrap();
    let result = engine.sync_once().await;
    assert!(result.error.is_none());
    assert_eq!(result.pushed, 1);
    assert_eq!(engine.sync_state().status, SyncStatus::Idle);
}

#[tokio::test]
async fn test_failing_record_is_isolated() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());

    for id in ["p1", "p2", "p3"] {
        store
            .upsert_record(Entity::Products, payload(json!({"id": id})))
            .unwrap();
    }
    remote.fail_id("p2");

    let result = engine.sync_once().await;
    assert_eq!(result.pushed, 2);
    assert_eq!(result.failed, 1);
    assert!(result.error.is_none());

    let pending: Vec<_> = store
        .outbox()
        .drain(10)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.record_id == "p2")
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(store.pending_count().unwrap(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());

    remote.clear_failures();
    let retried = engine.sync_once().await;
    assert_eq!(retried.pushed, 1);
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shop.db");
    let remote = Arc::new(MemoryRemote::new());

    {
        let store = Arc::new(LocalStore::open(&path).unwrap());
        let engine = SyncEngine::new(Arc::clone(&store), remote.clone(), test_config()).unwrap();
        engine.set_offline_mode(true).unwrap();
        store
            .upsert_record(Entity::Orders, payload(json!({"id": "o1", "total": 12})))
            .unwrap();
    }

    let store = Arc::new(LocalStore::open(&path).unwrap());
    let engine = SyncEngine::new(Arc::clone(&store), remote.clone(), test_config()).unwrap();
    assert!(engine.offline_mode());
    assert_eq!(engine.sync_state().pending_count, 1);

    engine.set_offline_mode(false).unwrap();
    let result = engine.sync_once().await;
    assert_eq!(result.pushed, 1);
    assert!(engine.sync_state().last_sync_at.is_some());
}

#[tokio::test]
async fn test_background_loop_runs_and_stops() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = device(remote.clone());
    store
        .upsert_record(Entity::Products, payload(json!({"id": "p1"})))
        .unwrap();

    let handle = engine.start_sync_loop(Duration::from_secs(3600));
    for _ in 0..50 {
        if store.pending_count().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.pending_count().unwrap(), 0);

    handle.shutdown().await;
}
