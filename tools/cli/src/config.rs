//! Application configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use shopsync_remote::FirebaseConfig;
use shopsync_sync::SyncConfig;

/// Environment variable holding the remote auth token.
pub const AUTH_TOKEN_ENV: &str = "SHOPSYNC_AUTH_TOKEN";

const APP_DIR: &str = "shopsync";

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database file. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub firebase: Option<FirebaseConfig>,
}

impl AppConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.sync.validate().context("Invalid sync settings")?;
        if let Some(firebase) = &config.firebase {
            firebase.validate().context("Invalid firebase settings")?;
        }
        Ok(config)
    }

    /// Database location, creating its parent directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        let path = match &self.database_path {
            Some(path) => path.clone(),
            None => dirs::data_local_dir()
                .context("No local data directory on this platform")?
                .join(APP_DIR)
                .join("shopsync.db"),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(path)
    }
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
}
