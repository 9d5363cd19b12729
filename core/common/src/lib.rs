//! Common utilities and types shared across the shopsync crates.
//!
//! This module provides the error taxonomy and the small set of domain types
//! (entities, payloads, auth tokens, timestamps) that every other crate speaks.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{now, timestamp_from_millis, AuthToken, Entity, Payload};
