//! Common error types for CalVault.

use thiserror::Error;

/// Top-level error type for CalVault operations.
///
/// The variants double as the failure taxonomy the scheduler acts on:
/// transient failures are retried with backoff, authentication failures
/// park the account until the user re-authenticates, and integrity or key
/// failures are surfaced immediately.
#[derive(Debug, Error)]
pub enum Error {
    /// Authenticated decryption failed: tampered or corrupted data.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Credentials were rejected by the provider.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The refresh token was revoked; user action is required.
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Disk write or read failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The master key cannot be loaded. No credential can be decrypted.
    #[error("Master key unavailable: {0}")]
    KeyUnavailable(String),

    /// The provider no longer accepts the stored sync cursor.
    #[error("Sync cursor expired: {0}")]
    CursorExpired(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation was cancelled by shutdown.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }

    /// Whether the account needs the user to re-authenticate.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::ReauthRequired(_))
    }

    /// Whether the failure makes every credential unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::KeyUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Network("timeout".into()).is_transient());
        assert!(Error::Io(std::io::Error::other("disk")).is_transient());
        assert!(!Error::Auth("bad password".into()).is_transient());

        assert!(Error::Auth("bad password".into()).requires_reauth());
        assert!(Error::ReauthRequired("revoked".into()).requires_reauth());
        assert!(!Error::Integrity("tag".into()).requires_reauth());

        assert!(Error::KeyUnavailable("missing".into()).is_fatal());
        assert!(!Error::Storage("full".into()).is_fatal());
    }
}
