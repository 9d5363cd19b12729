//! Engine event sink.

use shopsync_store::Conflict;

use crate::state::SyncState;

/// Receiver of engine events. At most one is configured at a time.
///
/// Callbacks run on the engine's task and must not block.
pub trait SyncObserver: Send + Sync {
    fn on_state_change(&self, state: &SyncState);

    fn on_conflict_detected(&self, conflict: &Conflict);
}
