//! Conflict resolution between a locally edited record and its remote copy.

use chrono::{DateTime, Utc};

use shopsync_remote::RemoteDocument;
use shopsync_store::{ConflictStrategy, NewConflict, Record, RemoteChange, Resolution};

/// Which side a resolution keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Deterministic conflict resolver.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Pick the winning side.
    ///
    /// Under last-writer-wins the local side wins only with a strictly later
    /// `updated_at`; ties go to the remote copy so every replica converges
    /// on the same value.
    pub fn winner(&self, local: &Record, remote: &RemoteDocument) -> Winner {
        match self.strategy {
            ConflictStrategy::LastWriterWins if local.updated_at > remote.updated_at => {
                Winner::Local
            }
            ConflictStrategy::LastWriterWins => Winner::Remote,
            ConflictStrategy::PreferRemote => Winner::Remote,
            ConflictStrategy::PreferLocal => Winner::Local,
        }
    }

    /// Resolve a conflict into its log entry and the local action to take.
    pub fn resolve(
        &self,
        local: &Record,
        remote: &RemoteDocument,
        detected_at: DateTime<Utc>,
    ) -> (NewConflict, Resolution) {
        let local_value = (!local.deleted).then(|| local.payload.clone());
        let remote_value = remote.live_payload().cloned();

        let (resolved_value, resolution) = match self.winner(local, remote) {
            Winner::Remote => (
                remote_value.clone(),
                Resolution::TakeRemote(RemoteChange {
                    payload: remote_value.clone(),
                    updated_at: remote.updated_at,
                    version: remote.version.clone(),
                }),
            ),
            Winner::Local => (
                local_value.clone(),
                Resolution::KeepLocal {
                    version: remote.version.clone(),
                },
            ),
        };

        let conflict = NewConflict {
            entity: local.entity,
            record_id: local.id.clone(),
            local_value,
            remote_value,
            resolved_value,
            strategy: self.strategy,
            detected_at,
        };
        (conflict, resolution)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::LastWriterWins)
    }
}
