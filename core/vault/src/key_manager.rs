//! Master key persistence and rotation.
//!
//! The key lives in a single owner-only file in the data directory. This
//! protects credentials against other local users and against copies of
//! the credential directory taken without the key file, but not against
//! an attacker running as the same user. It is weaker than a passphrase
//! or a platform keystore and is accepted in exchange for unattended
//! background sync.
//!
//! # Rotation protocol
//! 1. Decrypt every record under the current key and re-encrypt it under a
//!    fresh key, in memory.
//! 2. Persist the fresh key as `master.key.pending`.
//! 3. Replace each record atomically. On failure, put the old records back
//!    and remove the pending key.
//! 4. Rename the pending key over `master.key`.
//!
//! A crash after step 2 leaves a pending key behind; [`KeyManager::recover`]
//! rolls the rotation forward on the next start.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::context::KeyContext;
use crate::record::EncryptedCredential;
use crate::store::CredentialStore;
use calvault_common::fs as atomic;
use calvault_common::{Error, Result};
use calvault_crypto::{MasterKey, KEY_LENGTH};

/// Key file name inside the data directory.
pub const KEY_FILE_NAME: &str = "master.key";

/// Suffix of a key written by an unfinished rotation.
pub const PENDING_SUFFIX: &str = ".pending";

const KEY_FILE_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct KeyFile {
    format: u32,
    version: u32,
    fingerprint: String,
    key: String,
    created_at: DateTime<Utc>,
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Loads, creates and rotates the master key file.
pub struct KeyManager {
    path: PathBuf,
}

impl KeyManager {
    /// Manage the key file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Manage `master.key` inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(KEY_FILE_NAME))
    }

    /// Path of the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pending_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(PENDING_SUFFIX);
        PathBuf::from(name)
    }

    /// Whether the key file exists.
    pub async fn exists(&self) -> Result<bool> {
        tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| Error::KeyUnavailable(format!("Cannot access key file: {}", e)))
    }

    /// Load the existing key or create one on first run.
    ///
    /// # Postconditions
    /// - The key file exists with owner-only permissions
    /// - Repeated calls return the same key
    ///
    /// # Errors
    /// - `KeyUnavailable` if an existing key file cannot be read or parsed
    pub async fn get_or_create(&self) -> Result<MasterKey> {
        if self.exists().await? {
            return self.load().await;
        }
        self.create().await
    }

    /// Generate and persist a first-generation key.
    ///
    /// # Errors
    /// - `AlreadyExists` if a key file is present
    pub async fn create(&self) -> Result<MasterKey> {
        if self.exists().await? {
            return Err(Error::AlreadyExists(format!(
                "Key file already exists: {}",
                self.path.display()
            )));
        }
        if let Some(parent) = self.path.parent() {
            atomic::ensure_private_dir(parent).await?;
        }

        let key = MasterKey::generate(1);
        write_key_file(&self.path, &key).await?;
        info!(
            "Created master key v{} ({})",
            key.version(),
            key.fingerprint_hex()
        );
        Ok(key)
    }

    /// Load the key file.
    ///
    /// Permissions wider than owner-only are tightened with a warning.
    ///
    /// # Errors
    /// - `KeyUnavailable` if the file is missing, malformed, or its
    ///   fingerprint does not match the key it holds
    pub async fn load(&self) -> Result<MasterKey> {
        let key = read_key_file(&self.path).await?;
        restrict_permissions(&self.path).await;
        Ok(key)
    }

    /// Replace the master key, re-encrypting every credential.
    ///
    /// Holds the context exclusively, so no credential operation runs
    /// while records are being swapped.
    ///
    /// # Postconditions
    /// - On success every record is sealed under the new version and the
    ///   old key is gone from disk and memory
    /// - On failure the old key and old records are intact
    ///
    /// # Errors
    /// - `Integrity` if an existing record fails to decrypt; nothing changes
    /// - `Storage` if a write fails; completed writes are rolled back
    pub async fn rotate(&self, ctx: &KeyContext, store: &CredentialStore) -> Result<u32> {
        let mut guard = ctx.lock_exclusive().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| Error::KeyUnavailable("Master key is not loaded".to_string()))?;
        let next = MasterKey::generate(current.version() + 1);

        let old_records = store.get_all().await?;
        let mut new_records = Vec::with_capacity(old_records.len());
        for record in &old_records {
            let payload = record.open(current)?;
            new_records.push(EncryptedCredential::seal(
                &next,
                &record.label,
                record.provider,
                &payload,
            )?);
        }

        let pending = self.pending_path();
        write_key_file(&pending, &next).await?;

        for (written, record) in new_records.iter().enumerate() {
            if let Err(e) = store.put(&record.label, record).await {
                error!("Key rotation failed writing '{}': {}", record.label, e);
                self.roll_back(store, &old_records[..written]).await;
                return Err(e);
            }
        }

        if let Err(e) = commit_key_file(&pending, &self.path).await {
            error!("Key rotation failed promoting new key: {}", e);
            self.roll_back(store, &old_records).await;
            return Err(e);
        }

        info!(
            "Rotated master key to v{} ({}), re-encrypted {} credential(s)",
            next.version(),
            next.fingerprint_hex(),
            new_records.len()
        );
        let version = next.version();
        *guard = Some(next);
        Ok(version)
    }

    /// Restore records and drop the pending key.
    ///
    /// If a restore fails the pending key is kept so the next start can
    /// roll forward instead.
    async fn roll_back(&self, store: &CredentialStore, records: &[EncryptedCredential]) {
        let mut restored = true;
        for record in records {
            if let Err(e) = store.put(&record.label, record).await {
                error!("Failed to restore credential '{}': {}", record.label, e);
                restored = false;
            }
        }

        if restored {
            if let Err(e) = tokio::fs::remove_file(self.pending_path()).await {
                warn!("Failed to remove pending key: {}", e);
            }
        }
    }

    /// Finish a rotation interrupted by a crash.
    ///
    /// Every record still sealed under the active key is re-encrypted
    /// under the pending key, then the pending key is promoted.
    ///
    /// Returns `true` if a rotation was completed.
    ///
    /// # Errors
    /// - `Integrity` if a record matches neither key generation
    pub async fn recover(&self, ctx: &KeyContext, store: &CredentialStore) -> Result<bool> {
        let pending_path = self.pending_path();
        let pending_exists = tokio::fs::try_exists(&pending_path)
            .await
            .map_err(|e| Error::KeyUnavailable(format!("Cannot access pending key: {}", e)))?;
        if !pending_exists {
            return Ok(false);
        }

        let mut guard = ctx.lock_exclusive().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| Error::KeyUnavailable("Master key is not loaded".to_string()))?;
        let next = read_key_file(&pending_path).await?;
        warn!(
            "Found unfinished rotation from v{} to v{}, rolling forward",
            current.version(),
            next.version()
        );

        let mut migrated = 0usize;
        for record in store.get_all().await? {
            if record.key_version == next.version() {
                record.open(&next)?;
            } else if record.key_version == current.version() {
                let payload = record.open(current)?;
                let resealed =
                    EncryptedCredential::seal(&next, &record.label, record.provider, &payload)?;
                store.put(&record.label, &resealed).await?;
                migrated += 1;
            } else {
                return Err(Error::Integrity(format!(
                    "Credential '{}' is sealed under unknown key v{}",
                    record.label, record.key_version
                )));
            }
        }

        commit_key_file(&pending_path, &self.path).await?;
        info!(
            "Completed rotation to v{}, migrated {} credential(s)",
            next.version(),
            migrated
        );
        *guard = Some(next);
        Ok(true)
    }
}

async fn write_key_file(path: &Path, key: &MasterKey) -> Result<()> {
    let file = KeyFile {
        format: KEY_FILE_FORMAT,
        version: key.version(),
        fingerprint: key.fingerprint_hex(),
        key: STANDARD.encode(key.as_bytes()),
        created_at: Utc::now(),
    };
    let bytes = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
    atomic::atomic_write(path, &bytes).await
}

async fn commit_key_file(pending: &Path, path: &Path) -> Result<()> {
    tokio::fs::rename(pending, path)
        .await
        .map_err(|e| Error::Storage(format!("Failed to replace key file: {}", e)))?;
    if let Some(parent) = path.parent() {
        atomic::sync_dir(parent).await?;
    }
    Ok(())
}

async fn read_key_file(path: &Path) -> Result<MasterKey> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => Zeroizing::new(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::KeyUnavailable(format!(
                "Key file not found: {}",
                path.display()
            )));
        }
        Err(e) => {
            return Err(Error::KeyUnavailable(format!(
                "Cannot read key file: {}",
                e
            )));
        }
    };

    let file: KeyFile = serde_json::from_slice(&bytes)
        .map_err(|_| Error::KeyUnavailable("Key file is malformed".to_string()))?;
    if file.format != KEY_FILE_FORMAT {
        return Err(Error::KeyUnavailable(format!(
            "Unsupported key file format {}",
            file.format
        )));
    }

    let decoded = Zeroizing::new(
        STANDARD
            .decode(&file.key)
            .map_err(|_| Error::KeyUnavailable("Key file is malformed".to_string()))?,
    );
    if decoded.len() != KEY_LENGTH {
        return Err(Error::KeyUnavailable(format!(
            "Key has wrong length: {}",
            decoded.len()
        )));
    }
    let mut raw = [0u8; KEY_LENGTH];
    raw.copy_from_slice(&decoded);
    let key = MasterKey::from_bytes(raw, file.version);
    raw.zeroize();

    let fingerprint = hex_decode(&file.fingerprint)
        .ok_or_else(|| Error::KeyUnavailable("Key fingerprint is malformed".to_string()))?;
    if !key.matches_fingerprint(&fingerprint) {
        return Err(Error::KeyUnavailable(
            "Key file fingerprint mismatch".to_string(),
        ));
    }

    Ok(key)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return;
    };
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        warn!(
            "Key file {} has permissions {:o}, restricting to {:o}",
            path.display(),
            mode,
            atomic::PRIVATE_FILE_MODE
        );
        let perms = std::fs::Permissions::from_mode(atomic::PRIVATE_FILE_MODE);
        if let Err(e) = tokio::fs::set_permissions(path, perms).await {
            warn!("Failed to restrict key file permissions: {}", e);
        }
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
