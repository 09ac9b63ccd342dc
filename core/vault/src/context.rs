//! In-memory holder of the active master key.
//!
//! Every credential read or write runs under the context's read lock, from
//! fetching the record to decrypting it (or from sealing to storing it).
//! Rotation takes the write lock for its whole duration, so no operation
//! ever pairs a record with the wrong key generation.

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::record::EncryptedCredential;
use crate::store::CredentialStore;
use calvault_common::{CredentialPayload, Error, ProviderKind, Result};
use calvault_crypto::MasterKey;

/// Shared handle on the loaded master key.
pub struct KeyContext {
    key: RwLock<Option<MasterKey>>,
}

fn unavailable() -> Error {
    Error::KeyUnavailable("Master key is not loaded".to_string())
}

impl KeyContext {
    /// Wrap a loaded key.
    pub fn new(key: MasterKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    /// Version of the active key.
    pub async fn version(&self) -> Result<u32> {
        let guard = self.key.read().await;
        guard.as_ref().map(MasterKey::version).ok_or_else(unavailable)
    }

    /// Whether a key is loaded.
    pub async fn is_loaded(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Encrypt a payload under the active key.
    pub async fn seal(
        &self,
        label: &str,
        provider: ProviderKind,
        payload: &CredentialPayload,
    ) -> Result<EncryptedCredential> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or_else(unavailable)?;
        EncryptedCredential::seal(key, label, provider, payload)
    }

    /// Decrypt a record under the active key.
    pub async fn open(&self, record: &EncryptedCredential) -> Result<CredentialPayload> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or_else(unavailable)?;
        record.open(key)
    }

    /// Seal `payload` and store it for `label`.
    ///
    /// # Errors
    /// - `KeyUnavailable` if the key has been cleared
    /// - `Storage` if the write fails; the previous record stays intact
    pub async fn save(
        &self,
        store: &CredentialStore,
        label: &str,
        provider: ProviderKind,
        payload: &CredentialPayload,
    ) -> Result<()> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or_else(unavailable)?;
        let record = EncryptedCredential::seal(key, label, provider, payload)?;
        store.put(label, &record).await
    }

    /// Load and decrypt the credential for `label`.
    ///
    /// # Errors
    /// - `NotFound` if the account has no credential
    /// - `Integrity` if the record fails authentication
    /// - `KeyUnavailable` if the key has been cleared
    pub async fn load(
        &self,
        store: &CredentialStore,
        label: &str,
    ) -> Result<(ProviderKind, CredentialPayload)> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or_else(unavailable)?;
        let record = store.get(label).await?;
        let payload = record.open(key)?;
        Ok((record.provider, payload))
    }

    /// Delete the credential for `label`.
    ///
    /// Runs under the read lock so a rotation in progress never writes
    /// the record back after it is gone.
    pub async fn delete(&self, store: &CredentialStore, label: &str) -> Result<()> {
        let _guard = self.key.read().await;
        store.delete(label).await
    }

    /// Exclusive access for key rotation and recovery.
    pub(crate) async fn lock_exclusive(&self) -> RwLockWriteGuard<'_, Option<MasterKey>> {
        self.key.write().await
    }

    /// Drop the key from memory.
    ///
    /// Later operations fail with `KeyUnavailable`.
    pub async fn clear(&self) {
        let mut guard = self.key.write().await;
        if guard.take().is_some() {
            debug!("Master key cleared from memory");
        }
    }
}
