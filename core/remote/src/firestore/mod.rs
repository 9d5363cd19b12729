//! Firestore-backed remote store.
//!
//! This module provides:
//! - A REST v1 client mapping the remote contract onto document writes with
//!   `currentDocument` preconditions
//! - A codec between plain JSON payloads and Firestore typed values

mod client;
pub mod codec;

pub use client::FirestoreRemote;
