//! Durable local store for the shopsync engine.
//!
//! A single SQLite database holds:
//! - Records keyed by `(entity, id)`, including tombstones awaiting sync
//! - The outbox of local mutations not yet confirmed by the remote store
//! - The conflict log
//! - A flat meta key/value table
//!
//! Every record mutation and its outbox entry are written in one transaction.

pub mod conflicts;
pub mod model;
pub mod notify;
pub mod outbox;
mod schema;
pub mod store;

pub use conflicts::ConflictLog;
pub use model::{
    Conflict, ConflictStrategy, NewConflict, Operation, OutboxEntry, Reconciled, Record,
    RemoteAction, RemoteChange, Resolution, SortOrder, SortSpec,
};
pub use notify::{ChangeNotifier, DataChange};
pub use outbox::Outbox;
pub use store::LocalStore;

use shopsync_common::Error;

/// Map SQLite failures onto the storage error.
pub(crate) trait SqlResultExt<T> {
    fn storage(self) -> shopsync_common::Result<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn storage(self) -> shopsync_common::Result<T> {
        self.map_err(|e| Error::Storage(e.to_string()))
    }
}
