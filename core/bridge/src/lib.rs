//! Host bridge for shopsync.
//!
//! Exposes the local store and the sync engine to a presentation layer:
//! typed methods for in-process hosts, a JSON command protocol for IPC hosts,
//! and a broadcast stream of data, state and conflict events.

pub mod bridge;
pub mod events;
pub mod protocol;

pub use bridge::HostBridge;
pub use events::HostEvent;
pub use protocol::{ErrorBody, HostRequest, HostResponse};
