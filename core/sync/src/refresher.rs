//! Proactive renewal of expiring OAuth credentials.
//!
//! The refresher tracks every account's access-token expiry. A token is
//! renewed once its remaining lifetime drops below the safety margin,
//! either right before a sync run or from the periodic check loop. All
//! renewals happen under the account's serialization lock, and the new
//! payload is sealed and stored before it is used.
//!
//! A revoked refresh token suspends the account: its state becomes
//! `NeedsReauth` and no further refresh is attempted until [`TokenRefresher::resume`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{SyncContext, SyncUpdate};
use crate::locks::AccountGuard;
use crate::state::SyncStatus;
use calvault_common::{CredentialPayload, Error, ProviderKind, Result};
use calvault_providers::Refresh;

/// Token refresher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefresherConfig {
    /// Refresh once a token has less than this many seconds left.
    pub safety_margin_secs: u64,
    /// Period of the background expiry check.
    pub check_interval_secs: u64,
}

impl RefresherConfig {
    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_margin_secs as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 300,
            check_interval_secs: 60,
        }
    }
}

/// Keeps OAuth access tokens fresh.
pub struct TokenRefresher {
    ctx: Arc<SyncContext>,
    config: RefresherConfig,
    cancel: CancellationToken,
    expiries: Mutex<HashMap<String, DateTime<Utc>>>,
    suspended: Mutex<HashSet<String>>,
}

impl TokenRefresher {
    pub fn new(ctx: Arc<SyncContext>, config: RefresherConfig, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            config,
            cancel,
            expiries: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
        }
    }

    /// Learn expiries and suspensions from persisted state.
    ///
    /// # Errors
    /// - `KeyUnavailable` if the master key is gone. Unreadable single
    ///   records are logged and skipped; the scheduler reports them.
    pub async fn prime(&self) -> Result<()> {
        for state in self.ctx.states.all().await {
            if state.status.needs_reauth() {
                self.suspended_set().insert(state.account_label);
            }
        }

        for label in self.ctx.store.list().await? {
            match self.ctx.keys.load(&self.ctx.store, &label).await {
                Ok((_, payload)) => self.track(&label, payload.expires_at()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Skipping expiry of account {}: {}", label, e),
            }
        }
        Ok(())
    }

    /// Whether the account is waiting for re-authentication.
    pub fn is_suspended(&self, label: &str) -> bool {
        self.suspended_set().contains(label)
    }

    /// Allow refreshes again after the account was re-authenticated.
    pub fn resume(&self, label: &str) {
        if self.suspended_set().remove(label) {
            info!("Account {} resumed", label);
        }
    }

    /// Stop tracking a removed account.
    pub fn forget(&self, label: &str) {
        self.expiry_map().remove(label);
        self.suspended_set().remove(label);
    }

    /// Tracked expiry of an account's access token.
    pub fn expiry(&self, label: &str) -> Option<DateTime<Utc>> {
        self.expiry_map().get(label).copied()
    }

    /// Accounts whose token expires within the safety margin of `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let deadline = now + self.config.safety_margin();
        let suspended = self.suspended_set().clone();
        let mut due: Vec<String> = self
            .expiry_map()
            .iter()
            .filter(|(label, expires_at)| **expires_at <= deadline && !suspended.contains(*label))
            .map(|(label, _)| label.clone())
            .collect();
        due.sort();
        due
    }

    /// Load the account's credential, renewing it first if it is expiring.
    ///
    /// If renewal fails transiently while the current token is still
    /// valid, the current token is returned.
    ///
    /// # Errors
    /// - `ReauthRequired` if the account is suspended or its refresh token
    ///   was revoked
    /// - `NotFound`, `Integrity`, `KeyUnavailable` from the vault
    pub async fn ensure_fresh(
        &self,
        guard: &AccountGuard,
    ) -> Result<(ProviderKind, CredentialPayload)> {
        let label = guard.label();
        if self.is_suspended(label) {
            return Err(Error::ReauthRequired(format!(
                "Account {} is waiting for re-authentication",
                label
            )));
        }

        let (provider, payload) = self.ctx.keys.load(&self.ctx.store, label).await?;
        self.track(label, payload.expires_at());
        if !self.is_expiring(&payload, Utc::now()) {
            return Ok((provider, payload));
        }

        debug!("Access token of account {} is expiring", label);
        match self.refresh_locked(guard, provider, &payload).await {
            Ok(fresh) => Ok((provider, fresh)),
            Err(e) if e.is_transient() && !self.is_expired(&payload, Utc::now()) => {
                warn!(
                    "Refresh of account {} failed, using current token: {}",
                    label, e
                );
                Ok((provider, payload))
            }
            Err(e) => Err(e),
        }
    }

    /// Renew a credential the provider just rejected.
    pub async fn force_refresh(
        &self,
        guard: &AccountGuard,
        provider: ProviderKind,
        payload: &CredentialPayload,
    ) -> Result<CredentialPayload> {
        info!("Forcing refresh of account {}", guard.label());
        self.refresh_locked(guard, provider, payload).await
    }

    /// Suspend an account whose credential was rejected.
    ///
    /// Idempotent: only the first call records `NeedsReauth`.
    pub async fn suspend(&self, label: &str, reason: &Error) {
        if !self.suspended_set().insert(label.to_string()) {
            return;
        }
        warn!("Account {} needs re-authentication: {}", label, reason);

        let committed = self
            .ctx
            .states
            .update(label, |state| {
                state.status = SyncStatus::NeedsReauth;
                state.last_error = Some(reason.to_string());
            })
            .await;
        match committed {
            Ok(state) => self.ctx.publish(SyncUpdate::from_state(&state, None)),
            Err(e) => error!("Failed to record suspension of account {}: {}", label, e),
        }
    }

    /// Renew every due account once. Returns how many were checked.
    pub async fn check_once(&self) -> usize {
        let due = self.due(Utc::now());
        let mut checked = 0;

        for label in due {
            let guard = tokio::select! {
                _ = self.cancel.cancelled() => break,
                guard = self.ctx.locks.lock(&label) => guard,
            };

            match self.ensure_fresh(&guard).await {
                Ok(_) => {}
                Err(Error::NotFound(_)) => {
                    debug!("Account {} disappeared, forgetting its expiry", label);
                    self.expiry_map().remove(&label);
                }
                Err(e) if e.is_fatal() => error!("Refresh of account {} failed: {}", label, e),
                Err(e) => warn!("Refresh of account {} failed: {}", label, e),
            }
            checked += 1;
        }
        checked
    }

    /// Run the periodic expiry check until cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Token refresher started (every {:?})",
            self.config.check_interval()
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }

        info!("Token refresher stopped");
    }

    async fn refresh_locked(
        &self,
        guard: &AccountGuard,
        provider: ProviderKind,
        payload: &CredentialPayload,
    ) -> Result<CredentialPayload> {
        let label = guard.label();
        let adapter = self.ctx.registry.get(provider)?;

        match adapter.refresh(payload).await {
            Ok(Refresh::Refreshed(fresh)) => {
                self.ctx
                    .keys
                    .save(&self.ctx.store, label, provider, &fresh)
                    .await?;
                self.track(label, fresh.expires_at());
                info!("Refreshed credential of account {}", label);
                Ok(fresh)
            }
            Ok(Refresh::NotApplicable) => Ok(payload.clone()),
            Err(e) => {
                if e.requires_reauth() {
                    self.suspend(label, &e).await;
                }
                Err(e)
            }
        }
    }

    fn is_expiring(&self, payload: &CredentialPayload, now: DateTime<Utc>) -> bool {
        payload.is_refreshable()
            && payload
                .expires_at()
                .is_some_and(|expires_at| expires_at - now < self.config.safety_margin())
    }

    fn is_expired(&self, payload: &CredentialPayload, now: DateTime<Utc>) -> bool {
        payload
            .expires_at()
            .is_some_and(|expires_at| expires_at <= now)
    }

    fn track(&self, label: &str, expires_at: Option<DateTime<Utc>>) {
        let mut expiries = self.expiry_map();
        match expires_at {
            Some(expires_at) => {
                expiries.insert(label.to_string(), expires_at);
            }
            None => {
                expiries.remove(label);
            }
        }
    }

    fn expiry_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.expiries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn suspended_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.suspended.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
