//! Core sync engine that reconciles the local store with the remote store.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use shopsync_common::{now, timestamp_from_millis, AuthToken, Entity, Error, Result};
use shopsync_remote::{FirebaseConfig, RemoteDocument, RemoteSession, RemoteStore};
use shopsync_store::{
    Conflict, LocalStore, Operation, OutboxEntry, Reconciled, RemoteAction, RemoteChange,
};

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::events::SyncObserver;
use crate::scheduler::{self, SyncLoopHandle};
use crate::state::{SkipReason, SyncResult, SyncState, SyncStatus};

/// Meta key of the persisted offline-mode switch.
pub const META_OFFLINE_MODE: &str = "offlineModeEnabled";
/// Meta key of the last run's completion time (epoch ms).
pub const META_LAST_SYNC_AT: &str = "lastSyncAt";
/// Meta key of the last run's error message, empty when it succeeded.
pub const META_LAST_ERROR: &str = "lastError";

fn cursor_key(entity: Entity) -> String {
    format!("cursor:{}", entity)
}

/// Outbox entries for one record, collapsed into a single remote operation.
#[derive(Debug)]
struct PushGroup {
    entity: Entity,
    id: String,
    entries: Vec<OutboxEntry>,
}

impl PushGroup {
    /// The newest entry decides the effective operation.
    fn last(&self) -> &OutboxEntry {
        &self.entries[self.entries.len() - 1]
    }

    fn sequences(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.sequence).collect()
    }

    fn attempts(&self) -> u32 {
        self.entries.iter().map(|e| e.attempts).max().unwrap_or(0)
    }

    fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|e| e.last_attempt_at).max()
    }
}

/// Group drained entries by record, ordered by each group's first sequence.
fn group_entries(entries: Vec<OutboxEntry>) -> Vec<PushGroup> {
    let mut groups: Vec<PushGroup> = Vec::new();
    for entry in entries {
        match groups
            .iter_mut()
            .find(|g| g.entity == entry.entity && g.id == entry.record_id)
        {
            Some(group) => group.entries.push(entry),
            None => groups.push(PushGroup {
                entity: entry.entity,
                id: entry.record_id.clone(),
                entries: vec![entry],
            }),
        }
    }
    groups
}

/// Result of pushing one group.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Delivered,
    /// The remote copy moved on; resolve during the pull phase.
    Diverged,
}

/// Offline-first sync engine.
///
/// Runs are serialized: a run holds `run_lock` from start to finish and a
/// concurrent request returns immediately as skipped. Host setters only touch
/// plain values behind short-lived locks and never wait for a run.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    resolver: ConflictResolver,
    run_lock: tokio::sync::Mutex<()>,
    state: RwLock<SyncState>,
    session: RwLock<RemoteSession>,
    rate_limited_until: Mutex<Option<Instant>>,
    observer: RwLock<Option<Arc<dyn SyncObserver>>>,
    wake: Notify,
}

impl SyncEngine {
    /// Create an engine, restoring persisted state from the store's meta table.
    ///
    /// # Errors
    /// - `InvalidInput` if the config is unusable
    /// - `Storage` if meta cannot be read
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let offline_mode_enabled = store.get_meta(META_OFFLINE_MODE, "false")? == "true";
        let last_sync_at = match store.meta(META_LAST_SYNC_AT)? {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .and_then(|millis| timestamp_from_millis(millis).ok()),
            None => None,
        };
        let last_error = store
            .meta(META_LAST_ERROR)?
            .filter(|message| !message.is_empty());

        let state = SyncState {
            status: if last_error.is_some() {
                SyncStatus::Error
            } else {
                SyncStatus::Idle
            },
            is_online: true,
            last_sync_at,
            last_error,
            pending_count: store.pending_count()?,
            offline_mode_enabled,
        };

        info!(
            "Sync engine ready ({} remote, {} pending)",
            remote.name(),
            state.pending_count
        );

        Ok(Self {
            resolver: ConflictResolver::new(config.conflict_strategy),
            store,
            remote,
            config,
            run_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(state),
            session: RwLock::new(RemoteSession::default()),
            rate_limited_until: Mutex::new(None),
            observer: RwLock::new(None),
            wake: Notify::new(),
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SyncState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SyncState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn rate_limit_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.rate_limited_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wake
    }

    /// Register the event observer, replacing any previous one.
    pub fn configure_events(&self, observer: Arc<dyn SyncObserver>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn SyncObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `update` to the state and emit the new snapshot.
    fn update_state(&self, update: impl FnOnce(&mut SyncState)) -> SyncState {
        let snapshot = {
            let mut state = self.write_state();
            update(&mut state);
            state.clone()
        };
        if let Some(observer) = self.observer() {
            observer.on_state_change(&snapshot);
        }
        snapshot
    }

    /// Current state with a fresh pending count.
    pub fn sync_state(&self) -> SyncState {
        let mut snapshot = self.read_state().clone();
        match self.store.pending_count() {
            Ok(count) => snapshot.pending_count = count,
            Err(e) => warn!("Failed to count pending mutations: {}", e),
        }
        snapshot
    }

    /// Record connectivity reported by the host. Coming back online nudges
    /// the background loop.
    pub fn set_online_status(&self, online: bool) {
        let was_online = self.read_state().is_online;
        self.update_state(|state| state.is_online = online);
        if online && !was_online {
            info!("Back online");
            self.wake.notify_one();
        }
    }

    /// Replace or clear the auth token used from the next run on.
    pub fn set_auth_token(&self, token: Option<String>) -> Result<()> {
        let token = token.map(AuthToken::new).transpose()?;
        self.replace_token(token);
        Ok(())
    }

    /// Same as [`SyncEngine::set_auth_token`] for an already validated token.
    pub fn replace_token(&self, token: Option<AuthToken>) {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .token = token;
    }

    /// Replace the backend config used from the next run on.
    pub fn set_firebase_config(&self, config: FirebaseConfig) -> Result<()> {
        config.validate()?;
        info!(
            "Remote configured for project {} tenant {}",
            config.project_id, config.tenant_id
        );
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .firebase = Some(config);
        Ok(())
    }

    /// Suspend or resume all network activity. Persisted across restarts.
    pub fn set_offline_mode(&self, enabled: bool) -> Result<()> {
        self.store
            .set_meta(META_OFFLINE_MODE, if enabled { "true" } else { "false" })?;
        self.update_state(|state| state.offline_mode_enabled = enabled);
        info!("Offline mode {}", if enabled { "enabled" } else { "disabled" });
        if !enabled {
            self.wake.notify_one();
        }
        Ok(())
    }

    pub fn offline_mode(&self) -> bool {
        self.read_state().offline_mode_enabled
    }

    /// Make every queued entry eligible again and forget any rate-limit wait.
    /// Returns the number of entries reset.
    pub fn retry_failed(&self) -> Result<usize> {
        let reset = self.store.outbox().reset_attempts()?;
        *self.rate_limit_slot() = None;
        self.wake.notify_one();
        Ok(reset)
    }

    /// Spawn the periodic loop on the current tokio runtime.
    pub fn start_sync_loop(self: &Arc<Self>, interval: Duration) -> SyncLoopHandle {
        scheduler::spawn(Arc::clone(self), interval)
    }

    fn rate_limit_remaining(&self) -> Option<Duration> {
        let mut slot = self.rate_limit_slot();
        let now = Instant::now();
        match *slot {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    fn enter_rate_limit(&self, retry_after_ms: u64, result: &mut SyncResult) {
        warn!("Remote rate limited; backing off for {} ms", retry_after_ms);
        *self.rate_limit_slot() = Some(Instant::now() + Duration::from_millis(retry_after_ms));
        result.rate_limited = true;
        result.retry_after_ms = Some(retry_after_ms);
    }

    /// Bound a remote call by the request timeout.
    async fn call<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.request_timeout();
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!(
                "Remote call timed out after {:?}",
                limit
            ))),
        }
    }

    /// Run one push-then-pull cycle.
    ///
    /// Never fails: aborted runs are reported through the returned result and
    /// the `error` status.
    pub async fn sync_once(&self) -> SyncResult {
        {
            let state = self.read_state();
            if state.offline_mode_enabled {
                return SyncResult::skipped(SkipReason::OfflineMode);
            }
            if !state.is_online {
                return SyncResult::skipped(SkipReason::Offline);
            }
        }

        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("Sync already in progress");
            return SyncResult::skipped(SkipReason::InProgress);
        };

        if let Some(remaining) = self.rate_limit_remaining() {
            let remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
            debug!("Still rate limited for {} ms", remaining_ms);
            return SyncResult::rate_limited(remaining_ms);
        }

        let session = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        self.update_state(|state| state.status = SyncStatus::Syncing);
        debug!("Sync run started");

        let mut result = SyncResult::default();
        let outcome = self.run(&session, &mut result).await;
        self.finish(outcome, &mut result);
        result
    }

    async fn run(&self, session: &RemoteSession, result: &mut SyncResult) -> Result<()> {
        let diverged = self.push(session, result).await?;
        if result.rate_limited {
            return Ok(());
        }

        match self.pull(session, &diverged, result).await {
            Err(Error::RateLimited { retry_after_ms }) => {
                self.enter_rate_limit(retry_after_ms, result);
                Ok(())
            }
            other => other,
        }
    }

    fn finish(&self, outcome: Result<()>, result: &mut SyncResult) {
        let finished_at = now();
        let last_error = match outcome {
            Ok(()) => None,
            Err(e) => {
                error!("Sync run aborted: {}", e);
                Some(e.to_string())
            }
        };
        result.error = last_error.clone();

        if let Err(e) = self.persist_run(finished_at, last_error.as_deref()) {
            warn!("Failed to persist sync metadata: {}", e);
        }

        let retention = &self.config.conflict_retention;
        if let Err(e) = self
            .store
            .conflicts()
            .prune(retention.max_entries, retention.max_age())
        {
            warn!("Failed to prune conflict log: {}", e);
        }

        match self.store.outbox().exhausted(self.config.max_attempts) {
            Ok(0) => {}
            Ok(stuck) => warn!(
                "{} outbox entries failed {} or more times",
                stuck, self.config.max_attempts
            ),
            Err(e) => warn!("Failed to inspect outbox: {}", e),
        }

        let pending = self.store.pending_count();
        self.update_state(|state| {
            state.status = if last_error.is_some() {
                SyncStatus::Error
            } else {
                SyncStatus::Idle
            };
            state.last_sync_at = Some(finished_at);
            state.last_error = last_error;
            if let Ok(count) = pending {
                state.pending_count = count;
            }
        });
    }

    fn persist_run(&self, finished_at: DateTime<Utc>, last_error: Option<&str>) -> Result<()> {
        self.store
            .set_meta(META_LAST_SYNC_AT, &finished_at.timestamp_millis().to_string())?;
        self.store.set_meta(META_LAST_ERROR, last_error.unwrap_or(""))?;
        Ok(())
    }

    /// Deliver queued mutations. Returns records whose remote copy diverged.
    async fn push(
        &self,
        session: &RemoteSession,
        result: &mut SyncResult,
    ) -> Result<HashSet<(Entity, String)>> {
        let entries = self.store.outbox().drain(self.config.push_batch_limit)?;
        let mut diverged = HashSet::new();
        if entries.is_empty() {
            return Ok(diverged);
        }

        let groups = group_entries(entries);
        debug!("Pushing {} record(s)", groups.len());
        let started_at = now();

        for group in groups {
            let attempts = group.attempts();
            if !self
                .config
                .retry
                .is_due(attempts, group.last_attempt_at(), started_at)
            {
                if attempts >= self.config.max_attempts {
                    result.failed += 1;
                }
                debug!("Deferring {}/{} after {} attempt(s)", group.entity, group.id, attempts);
                continue;
            }

            match self.push_group(session, &group).await {
                Ok(PushOutcome::Delivered) => result.pushed += 1,
                Ok(PushOutcome::Diverged) => {
                    diverged.insert((group.entity, group.id.clone()));
                }
                Err(Error::RateLimited { retry_after_ms }) => {
                    self.enter_rate_limit(retry_after_ms, result);
                    break;
                }
                Err(e @ Error::Authentication(_)) | Err(e @ Error::Storage(_)) => return Err(e),
                Err(e) => {
                    warn!("Failed to push {}/{}: {}", group.entity, group.id, e);
                    let message = e.to_string();
                    let outbox = self.store.outbox();
                    for sequence in group.sequences() {
                        outbox.mark_attempt(sequence, &message)?;
                    }
                    result.failed += 1;
                }
            }
        }

        Ok(diverged)
    }

    async fn push_group(&self, session: &RemoteSession, group: &PushGroup) -> Result<PushOutcome> {
        let entity = group.entity;
        let id = group.id.as_str();
        let last = group.last();
        let updated_at = last.enqueued_at;

        let expected = self
            .store
            .record(entity, id)?
            .and_then(|record| record.sync_version);
        let expected = expected.as_deref();

        let written = match last.operation {
            Operation::Delete => {
                match self
                    .call(self.remote.delete(session, entity, id, updated_at, expected))
                    .await
                {
                    Ok(version) => Ok(Some(version)),
                    // Already gone remotely.
                    Err(Error::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Operation::Create | Operation::Update => {
                let payload = last.payload.as_ref().ok_or_else(|| {
                    Error::Serialization(format!("Outbox entry #{} has no payload", last.sequence))
                })?;

                let written = match expected {
                    Some(version) => {
                        match self
                            .call(self.remote.update(
                                session,
                                entity,
                                id,
                                payload,
                                updated_at,
                                Some(version),
                            ))
                            .await
                        {
                            Err(Error::NotFound(_)) => {
                                self.call(self.remote.create(session, entity, id, payload, updated_at))
                                    .await
                            }
                            other => other,
                        }
                    }
                    None => {
                        self.call(self.remote.create(session, entity, id, payload, updated_at))
                            .await
                    }
                };
                written.map(Some)
            }
        };

        match written {
            Ok(version) => {
                let purged = self.store.confirm_delivery(
                    entity,
                    id,
                    &group.sequences(),
                    version.as_deref(),
                )?;
                debug!(
                    "Delivered {}/{} ({} entr{}{})",
                    entity,
                    id,
                    group.entries.len(),
                    if group.entries.len() == 1 { "y" } else { "ies" },
                    if purged { ", tombstone purged" } else { "" }
                );
                Ok(PushOutcome::Delivered)
            }
            Err(Error::Conflict(_)) => self.check_redelivery(session, group).await,
            Err(e) => Err(e),
        }
    }

    /// After a precondition failure, check whether the remote already holds
    /// what we were sending (a redelivery after a lost acknowledgement).
    async fn check_redelivery(
        &self,
        session: &RemoteSession,
        group: &PushGroup,
    ) -> Result<PushOutcome> {
        let remote = self
            .call(self.remote.get(session, group.entity, &group.id))
            .await?;
        let last = group.last();

        let already_applied = match (last.operation, remote.as_ref()) {
            (Operation::Delete, None) => true,
            (Operation::Delete, Some(doc)) => doc.deleted,
            (_, Some(doc)) => match (&last.payload, doc.live_payload()) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => false,
            },
            (_, None) => false,
        };

        if already_applied {
            let version = remote.as_ref().map(|doc| doc.version.as_str());
            self.store
                .confirm_delivery(group.entity, &group.id, &group.sequences(), version)?;
            debug!("{}/{} was already delivered", group.entity, group.id);
            Ok(PushOutcome::Delivered)
        } else {
            info!(
                "Remote copy of {}/{} changed concurrently; resolving on pull",
                group.entity, group.id
            );
            Ok(PushOutcome::Diverged)
        }
    }

    fn cursor(&self, entity: Entity) -> Result<Option<DateTime<Utc>>> {
        match self.store.meta(&cursor_key(entity))? {
            Some(raw) => match raw.parse::<i64>() {
                Ok(millis) => Ok(Some(timestamp_from_millis(millis)?)),
                Err(_) => {
                    warn!("Ignoring corrupt pull cursor for {}: {}", entity, raw);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Fetch remote changes for every entity and apply them.
    async fn pull(
        &self,
        session: &RemoteSession,
        diverged: &HashSet<(Entity, String)>,
        result: &mut SyncResult,
    ) -> Result<()> {
        let fetches = Entity::ALL.into_iter().map(|entity| async move {
            let cursor = self.cursor(entity)?;
            let documents = self
                .call(self.remote.changed_since(session, entity, cursor))
                .await?;
            Ok::<_, Error>((entity, documents))
        });
        let batches = join_all(fetches).await;

        let mut seen = HashSet::new();
        for batch in batches {
            let (entity, documents) = batch?;
            let newest = documents.iter().map(|doc| doc.synced_at).max();

            for doc in documents {
                seen.insert((entity, doc.id.clone()));
                self.reconcile(entity, doc, result)?;
            }

            if let Some(newest) = newest {
                self.store
                    .set_meta(&cursor_key(entity), &newest.timestamp_millis().to_string())?;
            }
        }

        for (entity, id) in diverged {
            if seen.contains(&(*entity, id.clone())) {
                continue;
            }
            if let Some(doc) = self.call(self.remote.get(session, *entity, id)).await? {
                self.reconcile(*entity, doc, result)?;
            }
        }

        Ok(())
    }

    /// Reconcile one remote document with the local copy. Detection runs
    /// inside the store transaction that applies the outcome.
    fn reconcile(&self, entity: Entity, doc: RemoteDocument, result: &mut SyncResult) -> Result<()> {
        let id = doc.id.clone();
        let change = RemoteChange {
            payload: doc.live_payload().cloned(),
            updated_at: doc.updated_at,
            version: doc.version.clone(),
        };
        let detected_at = now();

        let outcome = self
            .store
            .reconcile_remote(entity, &id, &change, |local, pending| match local {
                None if doc.deleted => RemoteAction::Skip,
                None => RemoteAction::Apply,
                Some(local) if local.sync_version.as_deref() == Some(doc.version.as_str()) => {
                    RemoteAction::Skip
                }
                Some(_) if !pending => RemoteAction::Apply,
                Some(local) => {
                    let (conflict, resolution) = self.resolver.resolve(local, &doc, detected_at);
                    RemoteAction::Resolve(conflict, resolution)
                }
            })?;

        match outcome {
            Reconciled::Skipped => {}
            Reconciled::Applied => result.pulled += 1,
            Reconciled::Resolved {
                conflict,
                took_remote,
            } => {
                info!(
                    "Conflict on {}/{} resolved by {} in favour of {}",
                    entity,
                    id,
                    self.resolver.strategy().as_str(),
                    if took_remote { "remote" } else { "local" }
                );
                result.conflicts += 1;
                if took_remote {
                    result.pulled += 1;
                }
                self.emit_conflict(&conflict);
            }
        }
        Ok(())
    }

    fn emit_conflict(&self, conflict: &Conflict) {
        if let Some(observer) = self.observer() {
            observer.on_conflict_detected(conflict);
        }
    }
}
