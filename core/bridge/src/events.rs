//! Events pushed to the host.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use shopsync_store::{ChangeNotifier, Conflict, DataChange};
use shopsync_sync::{SyncObserver, SyncState};

/// Event delivered to subscribers, serialized as `{"event": name, "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum HostEvent {
    #[serde(rename = "data:changed")]
    DataChanged(DataChange),
    #[serde(rename = "sync:state")]
    SyncState(SyncState),
    #[serde(rename = "sync:conflict")]
    SyncConflict(Conflict),
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::DataChanged(_) => "data:changed",
            HostEvent::SyncState(_) => "sync:state",
            HostEvent::SyncConflict(_) => "sync:conflict",
        }
    }
}

/// Forwards store and engine callbacks onto the broadcast channel.
pub(crate) struct EventRelay {
    tx: broadcast::Sender<HostEvent>,
}

impl EventRelay {
    pub(crate) fn new(tx: broadcast::Sender<HostEvent>) -> Self {
        Self { tx }
    }

    fn publish(&self, event: HostEvent) {
        let name = event.name();
        // No subscribers is not an error.
        if self.tx.send(event).is_err() {
            trace!("Dropped {} event without subscribers", name);
        }
    }
}

impl ChangeNotifier for EventRelay {
    fn notify(&self, change: &DataChange) {
        self.publish(HostEvent::DataChanged(change.clone()));
    }
}

impl SyncObserver for EventRelay {
    fn on_state_change(&self, state: &SyncState) {
        self.publish(HostEvent::SyncState(state.clone()));
    }

    fn on_conflict_detected(&self, conflict: &Conflict) {
        self.publish(HostEvent::SyncConflict(conflict.clone()));
    }
}
