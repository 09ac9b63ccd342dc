//! Provider adapter trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use calvault_common::{CredentialPayload, Event, ProviderKind, ProviderSecret, Result, TimeRange};

/// Result of a refresh attempt.
#[derive(Debug)]
pub enum Refresh {
    /// The credential was renewed.
    Refreshed(CredentialPayload),
    /// The credential type does not expire.
    NotApplicable,
}

/// Events returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventChanges {
    /// Complete event set for the window. Replaces the snapshot.
    Full(Vec<Event>),
    /// Changes since the cursor. Merged into the snapshot.
    Delta {
        upserted: Vec<Event>,
        removed: Vec<String>,
    },
}

impl EventChanges {
    /// A delta with no changes.
    pub fn unchanged() -> Self {
        EventChanges::Delta {
            upserted: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Whether this is a full result.
    pub fn is_full(&self) -> bool {
        matches!(self, EventChanges::Full(_))
    }

    /// Stamp every event with the account it was fetched for.
    pub fn attribute_to(&mut self, account: &str) {
        let events = match self {
            EventChanges::Full(events) => events,
            EventChanges::Delta { upserted, .. } => upserted,
        };
        for event in events {
            event.source_account = account.to_string();
        }
    }
}

/// Outcome of [`ProviderAdapter::fetch_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub changes: EventChanges,
    /// Opaque cursor for the next incremental fetch.
    pub cursor: Option<String>,
}

/// Calendar provider capabilities.
///
/// Every provider implements the same fixed set of operations. Adapters
/// never see the master key or the credential store; they receive
/// decrypted payloads and hand back new ones.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter talks to.
    fn kind(&self) -> ProviderKind;

    /// Turn a setup-flow secret into a storable credential.
    ///
    /// # Preconditions
    /// - `secret` belongs to this adapter's provider
    ///
    /// # Postconditions
    /// - The returned credential has been verified against the provider
    ///
    /// # Errors
    /// - `Auth` if the provider rejects the secret
    /// - `Network` on transport failures
    async fn authenticate(&self, secret: &ProviderSecret) -> Result<CredentialPayload>;

    /// Renew an expiring credential.
    ///
    /// # Errors
    /// - `ReauthRequired` if the refresh token was revoked
    /// - `Network` on transport failures
    async fn refresh(&self, payload: &CredentialPayload) -> Result<Refresh>;

    /// Fetch events overlapping `range`.
    ///
    /// With a cursor from a previous fetch the adapter may return a delta.
    /// Events carry an empty `source_account`; the caller attributes them.
    ///
    /// # Errors
    /// - `Auth` if the credential is rejected
    /// - `CursorExpired` if the provider no longer accepts `cursor`
    /// - `Network` on transport or server failures
    async fn fetch_events(
        &self,
        payload: &CredentialPayload,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome>;
}
