//! In-memory scripted adapter for offline runs and testing.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::adapter::{EventChanges, FetchOutcome, ProviderAdapter, Refresh};
use calvault_common::{
    CredentialPayload, Error, Event, ProviderKind, ProviderSecret, Result, TimeRange,
};

/// Failure to inject into the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Network,
    Auth,
    Reauth,
    CursorExpired,
}

impl ScriptedFailure {
    fn into_error(self) -> Error {
        match self {
            ScriptedFailure::Network => Error::Network("scripted network failure".to_string()),
            ScriptedFailure::Auth => Error::Auth("scripted auth failure".to_string()),
            ScriptedFailure::Reauth => {
                Error::ReauthRequired("scripted revoked refresh token".to_string())
            }
            ScriptedFailure::CursorExpired => {
                Error::CursorExpired("scripted expired cursor".to_string())
            }
        }
    }
}

/// Provider adapter backed by in-memory state.
///
/// Serves a fixed event set, optionally with latency, queued failures and
/// queued deltas. Counts calls and tracks how many fetches overlap.
/// OAuth payloads whose access token has expired are rejected with `Auth`,
/// as a real provider would.
pub struct MemoryAdapter {
    kind: ProviderKind,
    events: Mutex<Vec<Event>>,
    deltas: Mutex<VecDeque<(Vec<Event>, Vec<String>)>>,
    fetch_failures: Mutex<VecDeque<ScriptedFailure>>,
    refresh_failures: Mutex<VecDeque<ScriptedFailure>>,
    cursors_seen: Mutex<Vec<Option<String>>>,
    latency: Option<std::time::Duration>,
    token_lifetime: Duration,
    reject_authentication: AtomicBool,
    fetch_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryAdapter {
    /// Create an adapter for `kind` with no events.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            events: Mutex::new(Vec::new()),
            deltas: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            refresh_failures: Mutex::new(VecDeque::new()),
            cursors_seen: Mutex::new(Vec::new()),
            latency: None,
            token_lifetime: Duration::hours(1),
            reject_authentication: AtomicBool::new(false),
            fetch_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Serve `events` on full fetches.
    pub fn with_events(self, events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
            ..self
        }
    }

    /// Delay every fetch.
    pub fn with_latency(self, latency: std::time::Duration) -> Self {
        Self {
            latency: Some(latency),
            ..self
        }
    }

    /// Lifetime of issued access tokens.
    pub fn with_token_lifetime(self, lifetime: Duration) -> Self {
        Self {
            token_lifetime: lifetime,
            ..self
        }
    }

    /// Replace the event set.
    pub async fn set_events(&self, events: Vec<Event>) {
        *self.events.lock().await = events;
    }

    /// Queue a delta for the next fetch that carries a cursor.
    pub async fn push_delta(&self, upserted: Vec<Event>, removed: Vec<String>) {
        self.deltas.lock().await.push_back((upserted, removed));
    }

    /// Fail the next fetch.
    pub async fn fail_next_fetch(&self, failure: ScriptedFailure) {
        self.fetch_failures.lock().await.push_back(failure);
    }

    /// Fail the next refresh.
    pub async fn fail_next_refresh(&self, failure: ScriptedFailure) {
        self.refresh_failures.lock().await.push_back(failure);
    }

    /// Reject setup-flow secrets.
    pub fn reject_authentication(&self, reject: bool) {
        self.reject_authentication.store(reject, Ordering::SeqCst);
    }

    /// Number of fetches started.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of refreshes attempted.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that ran at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Cursors passed to each fetch, in call order.
    pub async fn cursors_seen(&self) -> Vec<Option<String>> {
        self.cursors_seen.lock().await.clone()
    }

    fn issue_token(&self, refresh_token: String) -> CredentialPayload {
        let serial = self.refresh_calls.load(Ordering::SeqCst);
        CredentialPayload::OAuth {
            access_token: format!("memory-access-{}", serial),
            refresh_token,
            expires_at: Utc::now() + self.token_lifetime,
        }
    }
}

#[async_trait]
impl ProviderAdapter for MemoryAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn authenticate(&self, secret: &ProviderSecret) -> Result<CredentialPayload> {
        if secret.provider() != self.kind {
            return Err(Error::InvalidInput(format!(
                "{} secret given to {} adapter",
                secret.provider(),
                self.kind
            )));
        }
        if self.reject_authentication.load(Ordering::SeqCst) {
            return Err(Error::Auth("scripted authentication rejection".to_string()));
        }

        match secret {
            ProviderSecret::AppleId {
                apple_id,
                app_password,
            } => Ok(CredentialPayload::Password {
                apple_id: apple_id.clone(),
                password: app_password.clone(),
            }),
            ProviderSecret::GoogleAuthCode { code, .. } => {
                Ok(self.issue_token(format!("memory-refresh-{}", code)))
            }
        }
    }

    async fn refresh(&self, payload: &CredentialPayload) -> Result<Refresh> {
        let CredentialPayload::OAuth { refresh_token, .. } = payload else {
            return Ok(Refresh::NotApplicable);
        };

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.refresh_failures.lock().await.pop_front() {
            return Err(failure.into_error());
        }
        Ok(Refresh::Refreshed(self.issue_token(refresh_token.clone())))
    }

    async fn fetch_events(
        &self,
        payload: &CredentialPayload,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome> {
        let serial = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight {
            counter: &self.in_flight,
        };

        self.cursors_seen
            .lock()
            .await
            .push(cursor.map(str::to_string));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(failure) = self.fetch_failures.lock().await.pop_front() {
            return Err(failure.into_error());
        }
        if let Some(expires_at) = payload.expires_at() {
            if expires_at <= Utc::now() {
                return Err(Error::Auth("access token expired".to_string()));
            }
        }

        let changes = match cursor {
            Some(_) => match self.deltas.lock().await.pop_front() {
                Some((upserted, removed)) => EventChanges::Delta { upserted, removed },
                None => self.full(range).await,
            },
            None => self.full(range).await,
        };

        Ok(FetchOutcome {
            changes,
            cursor: Some(format!("memory-cursor-{}", serial)),
        })
    }
}

impl MemoryAdapter {
    async fn full(&self, range: &TimeRange) -> EventChanges {
        let events = self.events.lock().await;
        EventChanges::Full(events.iter().filter(|e| range.includes(e)).cloned().collect())
    }
}
