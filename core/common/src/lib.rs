//! Common utilities and types shared across CalVault modules.
//!
//! This module provides the error taxonomy, the account/event/credential
//! types every other crate speaks, recurrence expansion, and crash-safe
//! file replacement.

pub mod error;
pub mod fs;
pub mod recurrence;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    validate_label, Account, CredentialPayload, Event, ProviderKind, ProviderSecret, TimeRange,
};
