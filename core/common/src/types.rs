//! Common types used throughout shopsync.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Flat JSON object holding the business fields of a record.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A logical collection tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Products,
    Orders,
    Customers,
    Settings,
}

impl Entity {
    /// Every entity, in pull order.
    pub const ALL: [Entity; 4] = [
        Entity::Products,
        Entity::Orders,
        Entity::Customers,
        Entity::Settings,
    ];

    /// Collection name as stored locally and remotely.
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Products => "products",
            Entity::Orders => "orders",
            Entity::Customers => "customers",
            Entity::Settings => "settings",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Entity::ALL
            .into_iter()
            .find(|entity| entity.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown entity: {}", s)))
    }
}

/// Bearer token for the remote store.
///
/// The secret is wiped from memory on drop and never printed by `Debug`.
/// Deserializes from a plain string with the same blank check as [`AuthToken::new`].
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(try_from = "String")]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token, rejecting blank values.
    pub fn new(token: impl Into<String>) -> crate::Result<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Auth token cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the raw token for an authorization header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AuthToken {
    type Error = crate::Error;

    fn try_from(token: String) -> crate::Result<Self> {
        Self::new(token)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Current wall-clock time at millisecond precision.
///
/// Everything persisted or compared by the engine uses this resolution so
/// timestamps survive a round trip through the store unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Convert epoch milliseconds back into a timestamp.
pub fn timestamp_from_millis(millis: i64) -> crate::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| crate::Error::Serialization(format!("Timestamp out of range: {}", millis)))
}
