//! JSON command protocol for IPC hosts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use shopsync_common::{AuthToken, Entity, Error, Payload};
use shopsync_remote::FirebaseConfig;
use shopsync_store::SortOrder;

fn default_conflict_limit() -> usize {
    50
}

/// A host command, serialized as `{"command": "...", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "command",
    content = "args",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum HostRequest {
    ListRecords {
        entity: Entity,
        #[serde(default)]
        sort_by: Option<String>,
        #[serde(default)]
        order: Option<SortOrder>,
    },
    GetRecord {
        entity: Entity,
        id: String,
    },
    UpsertRecord {
        entity: Entity,
        payload: Payload,
    },
    DeleteRecord {
        entity: Entity,
        id: String,
    },
    SyncOnce,
    GetSyncStatus,
    GetPendingCount,
    ListConflicts {
        #[serde(default = "default_conflict_limit")]
        limit: usize,
    },
    SetOnlineStatus {
        online: bool,
    },
    SetAuthToken {
        #[serde(default)]
        token: Option<AuthToken>,
    },
    SetFirebaseConfig {
        config: FirebaseConfig,
    },
    GetOfflineMode,
    SetOfflineMode {
        enabled: bool,
    },
    RetryFailed,
}

impl HostRequest {
    /// Parse a raw command.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw)
            .map_err(|e| Error::InvalidInput(format!("Malformed command: {}", e)))
    }
}

/// Error half of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error name, e.g. `notFound`.
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Reply to a host command: `{"ok": value}` or `{"error": {"kind", "message"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostResponse {
    Ok(Value),
    Error(ErrorBody),
}

impl HostResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, HostResponse::Ok(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            HostResponse::Ok(value) => Some(value),
            HostResponse::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorBody> {
        match self {
            HostResponse::Ok(_) => None,
            HostResponse::Error(body) => Some(body),
        }
    }
}

impl<T: Serialize> From<Result<T, Error>> for HostResponse {
    fn from(result: Result<T, Error>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(Error::from)) {
            Ok(value) => HostResponse::Ok(value),
            Err(e) => HostResponse::Error(ErrorBody::from(&e)),
        }
    }
}
