//! Common types used throughout CalVault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// Maximum length of an account label in bytes.
pub const MAX_LABEL_LEN: usize = 128;

/// Validate an account label.
///
/// Labels are user-facing names ("Personal", "Work") and double as the
/// account key everywhere in the core.
///
/// # Errors
/// - Label is empty or only whitespace
/// - Label is longer than MAX_LABEL_LEN bytes
/// - Label contains control characters
pub fn validate_label(label: &str) -> crate::Result<()> {
    if label.trim().is_empty() {
        return Err(crate::Error::InvalidInput(
            "Account label cannot be empty".to_string(),
        ));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(crate::Error::InvalidInput(format!(
            "Account label exceeds {} bytes",
            MAX_LABEL_LEN
        )));
    }
    if label.chars().any(char::is_control) {
        return Err(crate::Error::InvalidInput(
            "Account label cannot contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Calendar provider backing an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// iCloud over CalDAV with an app-specific password.
    ICloud,
    /// Google Calendar over OAuth2.
    Google,
}

impl ProviderKind {
    /// Stable identifier used on disk and in associated data.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::ICloud => "icloud",
            ProviderKind::Google => "google",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "icloud" => Ok(ProviderKind::ICloud),
            "google" => Ok(ProviderKind::Google),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown provider: {}",
                other
            ))),
        }
    }
}

/// A configured calendar account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique user-facing label.
    pub label: String,
    /// Provider backing this account.
    pub provider: ProviderKind,
    /// Name of the encrypted credential record.
    pub credential_ref: String,
}

/// Decrypted provider credential.
///
/// Only ever exists in memory. String fields are zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialPayload {
    /// Static Apple ID + app-specific password.
    Password { apple_id: String, password: String },
    /// OAuth2 token pair.
    OAuth {
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
    },
}

impl CredentialPayload {
    /// Provider this payload authenticates against.
    pub fn provider(&self) -> ProviderKind {
        match self {
            CredentialPayload::Password { .. } => ProviderKind::ICloud,
            CredentialPayload::OAuth { .. } => ProviderKind::Google,
        }
    }

    /// Access token expiry, if the credential expires at all.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CredentialPayload::Password { .. } => None,
            CredentialPayload::OAuth { expires_at, .. } => Some(*expires_at),
        }
    }

    /// Whether the credential can be renewed without user interaction.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, CredentialPayload::OAuth { .. })
    }

    /// Serialize to JSON bytes for encryption.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from decrypted JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Drop for CredentialPayload {
    fn drop(&mut self) {
        match self {
            CredentialPayload::Password { apple_id, password } => {
                apple_id.zeroize();
                password.zeroize();
            }
            CredentialPayload::OAuth {
                access_token,
                refresh_token,
                ..
            } => {
                access_token.zeroize();
                refresh_token.zeroize();
            }
        }
    }
}

impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialPayload::Password { apple_id, .. } => f
                .debug_struct("Password")
                .field("apple_id", apple_id)
                .field("password", &"[REDACTED]")
                .finish(),
            CredentialPayload::OAuth { expires_at, .. } => f
                .debug_struct("OAuth")
                .field("access_token", &"[REDACTED]")
                .field("refresh_token", &"[REDACTED]")
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Secret handed over by the setup flow when an account is added.
#[derive(Clone)]
pub enum ProviderSecret {
    /// Apple ID and an app-specific password.
    AppleId { apple_id: String, app_password: String },
    /// Result of the OAuth2 authorization-code step.
    GoogleAuthCode {
        code: String,
        /// Overrides the configured redirect URI when the flow used another one.
        redirect_uri: Option<String>,
        /// PKCE verifier matching the challenge sent in the consent URL.
        pkce_verifier: Option<String>,
    },
}

impl ProviderSecret {
    /// Provider this secret belongs to.
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderSecret::AppleId { .. } => ProviderKind::ICloud,
            ProviderSecret::GoogleAuthCode { .. } => ProviderKind::Google,
        }
    }
}

impl Drop for ProviderSecret {
    fn drop(&mut self) {
        match self {
            ProviderSecret::AppleId {
                apple_id,
                app_password,
            } => {
                apple_id.zeroize();
                app_password.zeroize();
            }
            ProviderSecret::GoogleAuthCode {
                code,
                pkce_verifier,
                ..
            } => {
                code.zeroize();
                if let Some(verifier) = pkce_verifier {
                    verifier.zeroize();
                }
            }
        }
    }
}

impl fmt::Debug for ProviderSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSecret::AppleId { apple_id, .. } => f
                .debug_struct("AppleId")
                .field("apple_id", apple_id)
                .field("app_password", &"[REDACTED]")
                .finish(),
            ProviderSecret::GoogleAuthCode { redirect_uri, .. } => f
                .debug_struct("GoogleAuthCode")
                .field("code", &"[REDACTED]")
                .field("redirect_uri", redirect_uri)
                .finish(),
        }
    }
}

/// A calendar event as handed to the widget layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Provider-unique identifier.
    pub id: String,
    /// Start instant (all-day events start at UTC midnight).
    pub start: DateTime<Utc>,
    /// End instant.
    pub end: DateTime<Utc>,
    /// Whether the event spans whole days.
    pub all_day: bool,
    /// Event title.
    pub title: String,
    /// Free-form location.
    pub location: Option<String>,
    /// Raw RRULE for recurring series.
    pub recurrence_rule: Option<String>,
    /// IANA zone a series recurs in, so occurrences keep their wall-clock
    /// time across DST changes.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Start instants of occurrences removed from the series.
    #[serde(default)]
    pub exdates: Vec<DateTime<Utc>>,
    /// Calendar the event belongs to.
    pub calendar: Option<String>,
    /// Label of the account the event was fetched for.
    pub source_account: String,
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a time range.
    ///
    /// # Errors
    /// - Returns error if `start` is not before `end`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> crate::Result<Self> {
        if start >= end {
            return Err(crate::Error::InvalidInput(
                "Time range start must be before its end".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    /// Whether an event, or any occurrence of a series, overlaps this range.
    pub fn includes(&self, event: &Event) -> bool {
        if event.recurrence_rule.is_some() {
            return !crate::recurrence::occurrences(event, self).is_empty();
        }
        crate::recurrence::overlaps(event.start, event.end, self)
    }
}
