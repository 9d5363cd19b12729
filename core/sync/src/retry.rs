//! Backoff policy for outbox deliveries that failed with transient errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between delivery attempts of the same outbox entry.
///
/// Failed entries are never retried within a run; the policy decides when
/// the next run may try them again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay_ms: u64,
    /// Cap for exponential growth.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay_ms: duration_ms(initial_delay),
            max_delay_ms: duration_ms(max_delay),
            ..Self::default()
        }
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO).with_jitter(false)
    }

    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Earliest time an entry with `attempts` failures may be retried.
    ///
    /// `None` means it is due now.
    pub fn retry_at(
        &self,
        attempts: u32,
        last_attempt_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if attempts == 0 {
            return None;
        }
        let last = last_attempt_at?;
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts - 1))
            .unwrap_or(chrono::Duration::MAX);
        last.checked_add_signed(delay)
    }

    /// Whether an entry may be attempted at `now`.
    pub fn is_due(
        &self,
        attempts: u32,
        last_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        self.retry_at(attempts, last_attempt_at)
            .map_or(true, |at| at <= now)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
