//! The CalVault service handle.
//!
//! Opening the service loads (or on first run creates) the master key,
//! finishes any interrupted key rotation, and schedules every stored
//! account. The handle is the whole programmatic surface used by the
//! setup flow and the widget layer.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoreConfig;
use calvault_common::fs::ensure_private_dir;
use calvault_common::{
    validate_label, Account, Error, Event, ProviderKind, ProviderSecret, Result, TimeRange,
};
use calvault_providers::{AdapterRegistry, AuthorizationRequest};
use calvault_sync::{
    SyncContext, SyncReport, SyncScheduler, SyncState, SyncStateStore, SyncUpdate, TokenRefresher,
};
use calvault_vault::{CredentialStore, EncryptedCredential, KeyContext, KeyManager};

/// Running CalVault core.
pub struct CalVault {
    config: CoreConfig,
    keys: KeyManager,
    ctx: Arc<SyncContext>,
    scheduler: SyncScheduler,
    /// Serializes account setup and removal.
    accounts: Mutex<()>,
}

impl CalVault {
    /// Open the service with the iCloud and Google adapters.
    pub async fn open(config: CoreConfig) -> Result<Self> {
        let registry =
            AdapterRegistry::with_defaults(config.icloud.clone(), config.google.clone())?;
        Self::open_with_registry(config, registry).await
    }

    /// Open the service with a custom set of adapters.
    ///
    /// # Errors
    /// - `KeyUnavailable` if credentials exist but the key file is missing
    ///   or unreadable; they can never be decrypted again
    /// - `Integrity` if an interrupted rotation cannot be completed
    pub async fn open_with_registry(
        config: CoreConfig,
        registry: AdapterRegistry,
    ) -> Result<Self> {
        ensure_private_dir(&config.data_dir).await?;
        let store = CredentialStore::open(config.credentials_dir()).await?;
        let keys = KeyManager::in_dir(&config.data_dir);

        if !keys.exists().await? && !store.is_empty().await? {
            return Err(Error::KeyUnavailable(format!(
                "Key file {} is missing but credentials exist",
                keys.path().display()
            )));
        }
        let key_context = Arc::new(KeyContext::new(keys.get_or_create().await?));
        if keys.recover(&key_context, &store).await? {
            info!("Completed an interrupted key rotation");
        }

        let labels = store.list().await?;
        let states = SyncStateStore::open(config.state_path()).await?;
        for state in states.all().await {
            if !labels.contains(&state.account_label) {
                warn!("Dropping sync state of unknown account {}", state.account_label);
                states.remove(&state.account_label).await?;
            }
        }

        let ctx = Arc::new(SyncContext::new(
            key_context,
            Arc::new(store),
            registry,
            states,
        ));
        let root = CancellationToken::new();
        let refresher = Arc::new(TokenRefresher::new(
            ctx.clone(),
            config.refresh.clone(),
            root.child_token(),
        ));
        refresher.prime().await?;

        let scheduler = SyncScheduler::start(ctx.clone(), refresher, config.sync.clone(), root);
        let initial_delay = config.sync.sync_on_start.then_some(std::time::Duration::ZERO);
        for label in &labels {
            scheduler.add_account(label, initial_delay).await?;
        }

        info!(
            "CalVault started with {} account(s), key v{}",
            labels.len(),
            ctx.keys.version().await?
        );
        Ok(Self {
            config,
            keys,
            ctx,
            scheduler,
            accounts: Mutex::new(()),
        })
    }

    /// Verify a secret with the provider, store the credential, and
    /// schedule the account.
    ///
    /// The account syncs on its first periodic tick; call
    /// [`CalVault::trigger_sync`] to fetch right away.
    ///
    /// # Errors
    /// - `InvalidInput` for a bad label or a secret of another provider
    /// - `AlreadyExists` if the label is taken
    /// - `Auth` if the provider rejects the secret; nothing is stored
    pub async fn add_account(
        &self,
        label: &str,
        provider: ProviderKind,
        secret: ProviderSecret,
    ) -> Result<Account> {
        validate_label(label)?;
        check_secret(provider, &secret)?;
        let _accounts = self.accounts.lock().await;

        if self.ctx.store.exists(label).await? {
            return Err(Error::AlreadyExists(format!("Account {}", label)));
        }

        let adapter = self.ctx.registry.get(provider)?;
        let payload = adapter.authenticate(&secret).await?;
        drop(secret);
        self.ctx
            .keys
            .save(&self.ctx.store, label, provider, &payload)
            .await?;
        self.scheduler.add_account(label, None).await?;

        info!("Added {} account {}", provider, label);
        Ok(account(label, provider))
    }

    /// Delete an account's credential, state and events.
    ///
    /// # Errors
    /// - `NotFound` if the account does not exist
    pub async fn remove_account(&self, label: &str) -> Result<()> {
        let _accounts = self.accounts.lock().await;
        if !self.ctx.store.exists(label).await? {
            return Err(Error::NotFound(format!("Account {}", label)));
        }

        {
            let _guard = self.ctx.locks.lock(label).await;
            self.ctx.keys.delete(&self.ctx.store, label).await?;
        }
        match self.scheduler.remove_account(label).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!("Removed account {}", label);
        Ok(())
    }

    /// Every configured account, sorted by label.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let records = self.ctx.store.get_all().await?;
        Ok(records
            .iter()
            .map(|record| account(&record.label, record.provider))
            .collect())
    }

    /// Request a background sync without waiting for it.
    ///
    /// # Errors
    /// - `NotFound` for unknown accounts
    pub fn trigger_sync(&self, label: &str) -> Result<()> {
        self.scheduler.trigger(label)
    }

    /// Sync an account now and wait for the result.
    pub async fn sync_now(&self, label: &str) -> Result<SyncReport> {
        self.scheduler.sync_now(label).await
    }

    /// Latest events of an account overlapping `range`, sorted by start.
    ///
    /// Never waits on a running sync. Empty before the first sync.
    pub fn get_events(&self, label: &str, range: &TimeRange) -> Vec<Event> {
        self.scheduler.events(label, range)
    }

    /// Re-encrypt every credential under a new master key.
    ///
    /// Returns the new key version.
    pub async fn rotate_key(&self) -> Result<u32> {
        // Accounts cannot be added or removed while records are re-sealed
        let _accounts = self.accounts.lock().await;
        self.keys.rotate(&self.ctx.keys, &self.ctx.store).await
    }

    /// Version of the active master key.
    pub async fn key_version(&self) -> Result<u32> {
        self.ctx.keys.version().await
    }

    /// Replace a rejected credential and resume syncing.
    ///
    /// # Errors
    /// - `NotFound` if the account does not exist
    /// - `InvalidInput` if the secret belongs to another provider
    /// - `Auth` if the provider rejects the new secret
    pub async fn reauthenticate(&self, label: &str, secret: ProviderSecret) -> Result<()> {
        let _accounts = self.accounts.lock().await;
        let provider = self.ctx.store.get(label).await?.provider;
        check_secret(provider, &secret)?;

        let adapter = self.ctx.registry.get(provider)?;
        let payload = adapter.authenticate(&secret).await?;
        drop(secret);
        {
            let _guard = self.ctx.locks.lock(label).await;
            self.ctx
                .keys
                .save(&self.ctx.store, label, provider, &payload)
                .await?;
        }
        self.scheduler.resume(label).await?;

        info!("Re-authenticated account {}", label);
        Ok(())
    }

    /// Sync bookkeeping of an account.
    pub async fn sync_status(&self, label: &str) -> Option<SyncState> {
        self.scheduler.status(label).await
    }

    /// Subscribe to sync state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.scheduler.subscribe()
    }

    /// Consent URL for adding a Google account.
    ///
    /// # Errors
    /// - `NotFound` if the service runs without the Google adapter
    pub fn google_authorization_request(&self) -> Result<AuthorizationRequest> {
        self.ctx.registry.google()?.authorization_request()
    }

    /// Stop every background task and wipe the master key from memory.
    ///
    /// Later credential operations fail with `KeyUnavailable`.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown(self.config.shutdown_grace()).await;
        self.ctx.keys.clear().await;
        info!("CalVault stopped");
    }
}

fn check_secret(provider: ProviderKind, secret: &ProviderSecret) -> Result<()> {
    if secret.provider() != provider {
        return Err(Error::InvalidInput(format!(
            "{} secret given for a {} account",
            secret.provider(),
            provider
        )));
    }
    Ok(())
}

fn account(label: &str, provider: ProviderKind) -> Account {
    Account {
        label: label.to_string(),
        provider,
        credential_ref: EncryptedCredential::file_name(label),
    }
}
