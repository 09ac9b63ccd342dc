//! Core configuration.
//!
//! Every section has defaults, so a config file only needs the values it
//! changes. Loading policy (where the file lives, CLI overrides) belongs
//! to the host application.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use calvault_common::{Error, Result};
use calvault_providers::{GoogleConfig, ICloudConfig};
use calvault_sync::{RefresherConfig, SchedulerConfig, STATE_FILE_NAME};

/// Name of the credential directory inside the data directory.
pub const CREDENTIALS_DIR_NAME: &str = "credentials";

/// Application data directory used when none is configured.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calvault")
}

/// Top-level configuration of the core service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Directory holding the key file, credentials and sync state.
    pub data_dir: PathBuf,
    pub sync: SchedulerConfig,
    pub refresh: RefresherConfig,
    pub icloud: ICloudConfig,
    pub google: GoogleConfig,
    /// How long shutdown waits for running syncs.
    pub shutdown_grace_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync: SchedulerConfig::default(),
            refresh: RefresherConfig::default(),
            icloud: ICloudConfig::default(),
            google: GoogleConfig::default(),
            shutdown_grace_secs: 5,
        }
    }
}

impl CoreConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `Serialization` if it is not valid JSON for this structure
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("Config file {:?}", path)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_DIR_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
