//! Master key with secure memory handling.
//!
//! The key zeroizes its memory on drop so that key material does not
//! outlive the context that owns it.

use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of a key fingerprint in bytes.
pub const FINGERPRINT_LENGTH: usize = 8;

/// Root secret that encrypts every stored credential.
///
/// Each generation of the key carries a version number. Ciphertexts are
/// bound to the version they were produced under.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
    version: u32,
}

impl MasterKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate(version: u32) -> Self {
        let mut generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&generated);
        generated.as_mut_slice().zeroize();
        Self { key, version }
    }

    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH], version: u32) -> Self {
        Self { key, version }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Key generation this key belongs to.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Public identifier of the key.
    ///
    /// A short BLAKE2b digest under a fixed domain string. Safe to log and to
    /// store next to the key to detect a corrupted key file.
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LENGTH] {
        use blake2::digest::consts::U8;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U8>::new();
        hasher.update(b"calvault-key-fingerprint");
        hasher.update(self.version.to_be_bytes());
        hasher.update(self.key);

        let mut out = [0u8; FINGERPRINT_LENGTH];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Hex form of [`fingerprint`](Self::fingerprint).
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Compare a stored fingerprint in constant time.
    pub fn matches_fingerprint(&self, expected: &[u8]) -> bool {
        self.fingerprint().ct_eq(expected).into()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey(v{}, [REDACTED])", self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_random() {
        let key1 = MasterKey::generate(1);
        let key2 = MasterKey::generate(1);

        assert_ne!(key1.as_bytes(), key2.as_bytes());
        assert_eq!(key1.version(), 1);
    }

    #[test]
    fn test_fingerprint_depends_on_key_and_version() {
        let key = MasterKey::from_bytes([7u8; KEY_LENGTH], 1);
        let same = MasterKey::from_bytes([7u8; KEY_LENGTH], 1);
        let bumped = MasterKey::from_bytes([7u8; KEY_LENGTH], 2);

        assert_eq!(key.fingerprint(), same.fingerprint());
        assert_ne!(key.fingerprint(), bumped.fingerprint());
        assert!(key.matches_fingerprint(&same.fingerprint()));
        assert!(!key.matches_fingerprint(&bumped.fingerprint()));
        assert_eq!(key.fingerprint_hex().len(), FINGERPRINT_LENGTH * 2);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = MasterKey::from_bytes([0xAB; KEY_LENGTH], 3);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("ab"));
    }
}
