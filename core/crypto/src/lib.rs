//! Cryptographic primitives for CalVault.
//!
//! This module provides:
//! - Authenticated encryption with associated data (XChaCha20-Poly1305)
//! - The master key type with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Decryption fails closed: unverified plaintext is never returned
//! - Fingerprint comparisons are constant-time

pub mod aead;
pub mod keys;

pub use aead::{credential_associated_data, decrypt, encrypt, Sealed, NONCE_SIZE, TAG_SIZE};
pub use keys::{MasterKey, FINGERPRINT_LENGTH, KEY_LENGTH};
