//! Encrypted credential vault for CalVault.
//!
//! This crate provides:
//! - Master key persistence, loading and rotation
//! - The encrypted on-disk credential record
//! - Atomic, crash-safe credential storage
//! - A shared key context that pairs every credential operation with the
//!   key generation it was sealed under
//!
//! # Security Invariants
//! - No plaintext credential ever reaches disk or logs
//! - Each record is bound to its account label, provider and key version
//! - Key rotation is all-or-nothing

pub mod context;
pub mod key_manager;
pub mod record;
pub mod store;

pub use context::KeyContext;
pub use key_manager::{KeyManager, KEY_FILE_NAME};
pub use record::EncryptedCredential;
pub use store::CredentialStore;
