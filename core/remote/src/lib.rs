//! Remote document store access for shopsync.
//!
//! This crate defines the contract the sync engine speaks to the multi-tenant
//! remote store and ships two implementations:
//! - [`MemoryRemote`]: in-process store with fault injection, for tests and demos
//! - [`FirestoreRemote`]: Firestore REST v1

pub mod firestore;
pub mod memory;
pub mod provider;
pub mod session;

pub use firestore::FirestoreRemote;
pub use memory::MemoryRemote;
pub use provider::{RemoteDocument, RemoteStore};
pub use session::{FirebaseConfig, RemoteSession};
