//! The host-facing facade over the store and the engine.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use shopsync_common::{Entity, Error, Payload, Result};
use shopsync_remote::FirebaseConfig;
use shopsync_store::{Conflict, LocalStore, SortOrder, SortSpec};
use shopsync_sync::{SyncEngine, SyncLoopHandle, SyncResult, SyncState};

use crate::events::{EventRelay, HostEvent};
use crate::protocol::{ErrorBody, HostRequest, HostResponse};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Host bridge.
///
/// Installs itself as the store's change notifier and the engine's observer,
/// so every record mutation, state change and detected conflict reaches
/// subscribers.
pub struct HostBridge {
    store: Arc<LocalStore>,
    engine: Arc<SyncEngine>,
    events: broadcast::Sender<HostEvent>,
}

impl HostBridge {
    pub fn new(store: Arc<LocalStore>, engine: Arc<SyncEngine>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let relay = Arc::new(EventRelay::new(events.clone()));
        store.set_notifier(Some(relay.clone()));
        engine.configure_events(relay);

        Self {
            store,
            engine,
            events,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Start the periodic loop on the current runtime.
    pub fn start_sync_loop(&self, interval: Duration) -> SyncLoopHandle {
        self.engine.start_sync_loop(interval)
    }

    pub fn list_records(
        &self,
        entity: Entity,
        sort_by: Option<String>,
        order: Option<SortOrder>,
    ) -> Result<Vec<Payload>> {
        self.store
            .list_records(entity, &SortSpec::new(sort_by, order))
    }

    pub fn get_record(&self, entity: Entity, id: &str) -> Result<Payload> {
        self.store.get_record(entity, id)
    }

    pub fn upsert_record(&self, entity: Entity, payload: Payload) -> Result<Payload> {
        self.store.upsert_record(entity, payload)
    }

    pub fn delete_record(&self, entity: Entity, id: &str) -> Result<()> {
        self.store.delete_record(entity, id)
    }

    pub async fn sync_once(&self) -> SyncResult {
        self.engine.sync_once().await
    }

    pub fn sync_status(&self) -> SyncState {
        self.engine.sync_state()
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.store.pending_count()
    }

    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<Conflict>> {
        self.store.list_conflicts(limit)
    }

    pub fn set_online_status(&self, online: bool) {
        self.engine.set_online_status(online);
    }

    pub fn set_auth_token(&self, token: Option<String>) -> Result<()> {
        self.engine.set_auth_token(token)
    }

    pub fn set_firebase_config(&self, config: FirebaseConfig) -> Result<()> {
        self.engine.set_firebase_config(config)
    }

    pub fn offline_mode(&self) -> bool {
        self.engine.offline_mode()
    }

    pub fn set_offline_mode(&self, enabled: bool) -> Result<()> {
        self.engine.set_offline_mode(enabled)
    }

    pub fn retry_failed(&self) -> Result<usize> {
        let reset = self.engine.retry_failed()?;
        info!("Reset {} outbox entr{} for retry", reset, if reset == 1 { "y" } else { "ies" });
        Ok(reset)
    }

    /// Dispatch one command.
    pub async fn handle(&self, request: HostRequest) -> HostResponse {
        debug!("Host command: {:?}", request);

        match request {
            HostRequest::ListRecords {
                entity,
                sort_by,
                order,
            } => self.list_records(entity, sort_by, order).into(),
            HostRequest::GetRecord { entity, id } => self.get_record(entity, &id).into(),
            HostRequest::UpsertRecord { entity, payload } => {
                self.upsert_record(entity, payload).into()
            }
            HostRequest::DeleteRecord { entity, id } => self.delete_record(entity, &id).into(),
            HostRequest::SyncOnce => ok(self.sync_once().await),
            HostRequest::GetSyncStatus => ok(self.sync_status()),
            HostRequest::GetPendingCount => self.pending_count().into(),
            HostRequest::ListConflicts { limit } => self.list_conflicts(limit).into(),
            HostRequest::SetOnlineStatus { online } => {
                self.set_online_status(online);
                ok(())
            }
            HostRequest::SetAuthToken { token } => {
                self.engine.replace_token(token);
                ok(())
            }
            HostRequest::SetFirebaseConfig { config } => self.set_firebase_config(config).into(),
            HostRequest::GetOfflineMode => ok(self.offline_mode()),
            HostRequest::SetOfflineMode { enabled } => self.set_offline_mode(enabled).into(),
            HostRequest::RetryFailed => self.retry_failed().into(),
        }
    }

    /// Dispatch a raw JSON command and serialize the reply.
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match HostRequest::from_json(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => HostResponse::Error(ErrorBody::from(&e)),
        };
        match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => format!(
                r#"{{"error":{{"kind":"serialization","message":{:?}}}}}"#,
                e.to_string()
            ),
        }
    }
}

fn ok<T: Serialize>(value: T) -> HostResponse {
    Ok::<_, Error>(value).into()
}
