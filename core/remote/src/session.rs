//! Connection settings and per-run credentials.

use serde::{Deserialize, Serialize};

use shopsync_common::{AuthToken, Error, Result};

/// Default Firestore REST endpoint.
pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";

fn default_base_url() -> String {
    DEFAULT_FIRESTORE_URL.to_string()
}

fn default_database_id() -> String {
    "(default)".to_string()
}

/// Remote backend settings supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirebaseConfig {
    pub api_key: String,
    pub project_id: String,
    /// Partition of the remote store owned by this installation.
    pub tenant_id: String,
    #[serde(default = "default_database_id")]
    pub database_id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl FirebaseConfig {
    pub fn new(
        api_key: impl Into<String>,
        project_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            tenant_id: tenant_id.into(),
            database_id: default_database_id(),
            base_url: default_base_url(),
        }
    }

    /// Reject configs the backend could never accept.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("projectId", &self.project_id),
            ("tenantId", &self.tenant_id),
            ("databaseId", &self.database_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{} cannot be empty", name)));
            }
            if value.contains('/') {
                return Err(Error::InvalidInput(format!("{} cannot contain '/'", name)));
            }
        }
        Ok(())
    }
}

/// Credentials and settings captured at the start of a sync run.
///
/// Host updates made mid-run apply from the next run on.
#[derive(Debug, Clone, Default)]
pub struct RemoteSession {
    pub token: Option<AuthToken>,
    pub firebase: Option<FirebaseConfig>,
}

impl RemoteSession {
    pub fn new(token: Option<AuthToken>, firebase: Option<FirebaseConfig>) -> Self {
        Self { token, firebase }
    }

    /// The auth token, or `Authentication` if none is set.
    pub fn require_token(&self) -> Result<&AuthToken> {
        self.token
            .as_ref()
            .ok_or_else(|| Error::Authentication("No auth token set".to_string()))
    }

    /// The backend config, or `Authentication` if none is set.
    pub fn require_firebase(&self) -> Result<&FirebaseConfig> {
        self.firebase
            .as_ref()
            .ok_or_else(|| Error::Authentication("Firebase config not set".to_string()))
    }
}
