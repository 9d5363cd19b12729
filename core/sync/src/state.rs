//! Observable engine state and per-run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    /// The last run aborted; the next run retries from scratch.
    Error,
}

/// Snapshot of the engine state pushed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub is_online: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_count: u64,
    pub offline_mode_enabled: bool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            is_online: true,
            last_sync_at: None,
            last_error: None,
            pending_count: 0,
            offline_mode_enabled: false,
        }
    }
}

/// Why a run did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    OfflineMode,
    Offline,
    InProgress,
    RateLimited,
}

/// Outcome of one `sync_once` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Effective remote operations delivered.
    pub pushed: usize,
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Deliveries that failed this run, plus deferred ones past the attempt ceiling.
    pub failed: usize,
    pub conflicts: usize,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Set when the run aborted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason),
            ..Self::default()
        }
    }

    /// Skipped because the remote asked us to wait `retry_after_ms` more.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            rate_limited: true,
            retry_after_ms: Some(retry_after_ms),
            ..Self::skipped(SkipReason::RateLimited)
        }
    }
}
