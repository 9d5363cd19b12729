//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use shopsync_common::{Error, Result};
use shopsync_store::ConflictStrategy;

use crate::retry::RetryPolicy;

/// How much of the conflict log survives pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictRetention {
    pub max_entries: usize,
    pub max_age_days: u32,
}

impl ConflictRetention {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_age_days))
    }
}

impl Default for ConflictRetention {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_age_days: 90,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the background sync loop.
    pub interval_secs: u64,
    /// Upper bound on any single remote call.
    pub request_timeout_secs: u64,
    /// Outbox entries considered per run.
    pub push_batch_limit: usize,
    /// Failures after which an entry is reported as failing. It is still
    /// retried, never dropped.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub conflict_strategy: ConflictStrategy,
    pub conflict_retention: ConflictRetention,
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::InvalidInput(
                "Sync interval must be at least one second".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "Request timeout must be at least one second".to_string(),
            ));
        }
        if self.push_batch_limit == 0 {
            return Err(Error::InvalidInput(
                "Push batch limit must be positive".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidInput(
                "Backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            request_timeout_secs: 15,
            push_batch_limit: 200,
            max_attempts: 5,
            retry: RetryPolicy::default(),
            conflict_strategy: ConflictStrategy::default(),
            conflict_retention: ConflictRetention::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"interval_secs": 60, "conflict_strategy": "preferRemote", "retry": {"jitter": false}}"#,
        )
        .unwrap();

        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.conflict_strategy, ConflictStrategy::PreferRemote);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.push_batch_limit, 200);
        assert_eq!(config.conflict_retention.max_entries, 1_000);
    }

    #[test]
    fn test_validation() {
        assert!(SyncConfig::default().validate().is_ok());

        let config = SyncConfig {
            push_batch_limit: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }
}
