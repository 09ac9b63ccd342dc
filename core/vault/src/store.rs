//! Persistent storage of encrypted credential records.
//!
//! One file per account under the credentials directory. Every write goes
//! through a temp file that is fsynced and renamed over the target, so a
//! crash leaves either the old record or the new one.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::record::EncryptedCredential;
use calvault_common::fs as atomic;
use calvault_common::{validate_label, Error, Result};

/// Store of encrypted credentials, keyed by account label.
///
/// Writes are serialized; reads may run concurrently.
pub struct CredentialStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl CredentialStore {
    /// Open the store rooted at `dir`.
    ///
    /// # Postconditions
    /// - The directory exists with owner-only permissions
    /// - Temp files left by an interrupted write are removed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        atomic::ensure_private_dir(&dir).await?;

        let removed = atomic::remove_orphaned_temps(&dir).await?;
        if removed > 0 {
            warn!("Removed {} orphaned credential temp file(s)", removed);
        }

        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, label: &str) -> PathBuf {
        self.dir.join(EncryptedCredential::file_name(label))
    }

    /// Insert or replace the record for `label`.
    ///
    /// # Errors
    /// - `InvalidInput` if `label` is invalid or differs from the record's
    /// - `Storage` if the write cannot complete. The previous record, if
    ///   any, stays intact.
    pub async fn put(&self, label: &str, record: &EncryptedCredential) -> Result<()> {
        validate_label(label)?;
        if record.label != label {
            return Err(Error::InvalidInput(format!(
                "Record for '{}' cannot be stored under '{}'",
                record.label, label
            )));
        }

        let bytes = record.to_bytes()?;
        let _guard = self.lock.write().await;
        atomic::atomic_write(&self.record_path(label), &bytes).await?;
        debug!(label, key_version = record.key_version, "Stored credential");
        Ok(())
    }

    /// Fetch the record for `label`.
    ///
    /// # Errors
    /// - `NotFound` if no record exists
    /// - `Integrity` if the file is corrupted or names another account
    pub async fn get(&self, label: &str) -> Result<EncryptedCredential> {
        let _guard = self.lock.read().await;
        self.read_record(label).await
    }

    async fn read_record(&self, label: &str) -> Result<EncryptedCredential> {
        let bytes = match tokio::fs::read(self.record_path(label)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("No credential for '{}'", label)));
            }
            Err(e) => return Err(Error::Storage(format!("Failed to read credential: {}", e))),
        };

        let record = EncryptedCredential::from_bytes(&bytes)?;
        if record.label != label {
            return Err(Error::Integrity(format!(
                "Record file for '{}' holds a credential for another account",
                label
            )));
        }
        Ok(record)
    }

    /// Whether a record exists for `label`.
    pub async fn exists(&self, label: &str) -> Result<bool> {
        let _guard = self.lock.read().await;
        tokio::fs::try_exists(self.record_path(label))
            .await
            .map_err(|e| Error::Storage(format!("Failed to stat credential: {}", e)))
    }

    /// Remove the record for `label`.
    ///
    /// # Errors
    /// - `NotFound` if no record exists
    pub async fn delete(&self, label: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let path = self.record_path(label);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("No credential for '{}'", label)));
            }
            Err(e) => return Err(Error::Storage(format!("Failed to delete credential: {}", e))),
        }
        atomic::sync_dir(&self.dir).await?;
        debug!(label, "Deleted credential");
        Ok(())
    }

    /// Labels of all stored credentials, sorted.
    pub async fn list(&self) -> Result<BTreeSet<String>> {
        let _guard = self.lock.read().await;
        self.list_unlocked().await
    }

    async fn list_unlocked(&self) -> Result<BTreeSet<String>> {
        let mut labels = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to list credentials: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to list credentials: {}", e)))?
        {
            let path = entry.path();
            if atomic::is_temp_file(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match EncryptedCredential::label_from_file_name(name) {
                Some(label) => {
                    labels.insert(label);
                }
                None => warn!("Ignoring unexpected file in credential store: {}", name),
            }
        }

        Ok(labels)
    }

    /// All stored records, in label order.
    pub async fn get_all(&self) -> Result<Vec<EncryptedCredential>> {
        let _guard = self.lock.read().await;
        let mut records = Vec::new();
        for label in self.list_unlocked().await? {
            records.push(self.read_record(&label).await?);
        }
        Ok(records)
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.list().await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calvault_common::{CredentialPayload, ProviderKind};
    use calvault_crypto::MasterKey;
    use tempfile::TempDir;

    fn sealed(key: &MasterKey, label: &str, password: &str) -> EncryptedCredential {
        let payload = CredentialPayload::Password {
            apple_id: "a@b.com".to_string(),
            password: password.to_string(),
        };
        EncryptedCredential::seal(key, label, ProviderKind::ICloud, &payload).unwrap()
    }

    async fn setup() -> (TempDir, CredentialStore, MasterKey) {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::open(temp.path().join("credentials"))
            .await
            .unwrap();
        (temp, store, MasterKey::generate(1))
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_temp, store, key) = setup().await;
        let record = sealed(&key, "Personal", "pw");

        store.put("Personal", &record).await.unwrap();
        assert!(store.exists("Personal").await.unwrap());
        assert_eq!(store.get("Personal").await.unwrap(), record);

        store.delete("Personal").await.unwrap();
        assert!(!store.exists("Personal").await.unwrap());
        assert!(matches!(store.get("Personal").await, Err(Error::NotFound(_))));
        assert!(matches!(store.delete("Personal").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (_temp, store, key) = setup().await;
        for label in ["Work", "Personal", "Family"] {
            store.put(label, &sealed(&key, label, "pw")).await.unwrap();
        }

        let labels: Vec<_> = store.list().await.unwrap().into_iter().collect();
        assert_eq!(labels, vec!["Family", "Personal", "Work"]);
        assert_eq!(store.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_label_mismatch_rejected() {
        let (_temp, store, key) = setup().await;
        let record = sealed(&key, "Personal", "pw");

        assert!(matches!(
            store.put("Work", &record).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_before_rename_keeps_old_record() {
        let (temp, store, key) = setup().await;
        let old = sealed(&key, "Personal", "old-pw");
        store.put("Personal", &old).await.unwrap();

        // Simulate a crash after the temp file is written but before the rename
        let new = sealed(&key, "Personal", "new-pw");
        let target = store.dir().join(EncryptedCredential::file_name("Personal"));
        let temp_path = atomic::write_temp(&target, &new.to_bytes().unwrap())
            .await
            .unwrap();
        assert!(temp_path.exists());
        drop(store);

        let reopened = CredentialStore::open(temp.path().join("credentials"))
            .await
            .unwrap();
        let loaded = reopened.get("Personal").await.unwrap();

        assert_eq!(loaded, old);
        assert!(!temp_path.exists());
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_record_is_integrity_error() {
        let (_temp, store, key) = setup().await;
        store.put("Personal", &sealed(&key, "Personal", "pw")).await.unwrap();

        let path = store.dir().join(EncryptedCredential::file_name("Personal"));
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(store.get("Personal").await, Err(Error::Integrity(_))));
    }

    #[tokio::test]
    async fn test_record_under_wrong_file_detected() {
        let (_temp, store, key) = setup().await;
        store.put("Personal", &sealed(&key, "Personal", "pw")).await.unwrap();

        let from = store.dir().join(EncryptedCredential::file_name("Personal"));
        let to = store.dir().join(EncryptedCredential::file_name("Work"));
        tokio::fs::rename(&from, &to).await.unwrap();

        assert!(matches!(store.get("Work").await, Err(Error::Integrity(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_records_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, store, key) = setup().await;
        store.put("Personal", &sealed(&key, "Personal", "pw")).await.unwrap();

        let path = store.dir().join(EncryptedCredential::file_name("Personal"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
