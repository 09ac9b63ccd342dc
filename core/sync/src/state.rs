//! Sync state tracking and persistence.
//!
//! One [`SyncState`] per account, kept in memory and mirrored to a single
//! JSON file. Every change goes through [`SyncStateStore::update`], which
//! persists the new map before publishing it, so a crash never leaves the
//! file ahead of or behind a committed transition.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use calvault_common::fs::atomic_write;
use calvault_common::{Error, Result};

/// File name of the state file inside the data directory.
pub const STATE_FILE_NAME: &str = "sync_state.json";

/// Sync status of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Registered, not synced yet.
    Pending,
    /// Last run succeeded.
    Ok,
    /// The provider rejected the credential; waiting for the user.
    NeedsReauth,
    /// Transient failure; retrying with backoff.
    Backoff {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// Last run failed with an error that is never retried.
    Failed,
}

impl SyncStatus {
    /// Whether runs are parked until the account is re-authenticated.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, SyncStatus::NeedsReauth)
    }
}

/// Persisted sync bookkeeping for a single account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub account_label: String,
    /// Opaque provider cursor for the next incremental fetch.
    pub cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub last_error: Option<String>,
}

impl SyncState {
    /// Fresh state for a newly registered account.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            account_label: label.into(),
            cursor: None,
            last_synced_at: None,
            last_full_sync_at: None,
            status: SyncStatus::Pending,
            last_error: None,
        }
    }

    /// Whether the next run must ignore the cursor.
    pub fn needs_full_sync(&self, now: DateTime<Utc>, full_resync_interval: Duration) -> bool {
        if self.cursor.is_none() {
            return true;
        }
        match self.last_full_sync_at {
            Some(last) => now - last >= full_resync_interval,
            None => true,
        }
    }
}

/// Single-writer store of every account's [`SyncState`].
pub struct SyncStateStore {
    path: PathBuf,
    states: RwLock<BTreeMap<String, SyncState>>,
    writer: Mutex<()>,
}

impl SyncStateStore {
    /// Open the state file at `path`.
    ///
    /// A missing file starts empty. An unreadable one is logged and
    /// replaced on the next commit: it holds no secrets, and losing it
    /// only costs a full resync.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let states = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, SyncState>>(&bytes) {
                Ok(states) => states,
                Err(e) => {
                    warn!("Discarding unreadable sync state {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read sync state {:?}: {}",
                    path, e
                )))
            }
        };

        debug!("Loaded sync state for {} accounts", states.len());
        Ok(Self {
            path,
            states: RwLock::new(states),
            writer: Mutex::new(()),
        })
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// State of one account.
    pub async fn get(&self, label: &str) -> Option<SyncState> {
        self.states.read().await.get(label).cloned()
    }

    /// States of every account, sorted by label.
    pub async fn all(&self) -> Vec<SyncState> {
        self.states.read().await.values().cloned().collect()
    }

    /// Apply `change` to the account's state and persist it.
    ///
    /// Creates a [`SyncState::new`] entry if the account has none.
    /// `last_synced_at` never moves backwards. If persisting fails the
    /// in-memory state is left untouched.
    pub async fn update<F>(&self, label: &str, change: F) -> Result<SyncState>
    where
        F: FnOnce(&mut SyncState),
    {
        let _writer = self.writer.lock().await;

        let mut next = self.states.read().await.clone();
        let entry = next
            .entry(label.to_string())
            .or_insert_with(|| SyncState::new(label));
        let previous = entry.last_synced_at;
        change(entry);
        entry.last_synced_at = match (previous, entry.last_synced_at) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
        let updated = entry.clone();

        self.persist(&next).await?;
        *self.states.write().await = next;
        Ok(updated)
    }

    /// Register an account if it has no state yet.
    pub async fn ensure(&self, label: &str) -> Result<SyncState> {
        if let Some(state) = self.get(label).await {
            return Ok(state);
        }
        self.update(label, |_| {}).await
    }

    /// Forget an account.
    pub async fn remove(&self, label: &str) -> Result<()> {
        let _writer = self.writer.lock().await;

        let mut next = self.states.read().await.clone();
        if next.remove(label).is_none() {
            return Ok(());
        }
        self.persist(&next).await?;
        *self.states.write().await = next;
        Ok(())
    }

    async fn persist(&self, states: &BTreeMap<String, SyncState>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(states)?;
        atomic_write(&self.path, &bytes).await
    }
}
