//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation. Nonce, ciphertext
//! and tag are kept apart so records can store them as separate fields.

use chacha20poly1305::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Tag, XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, Zeroizing};

use crate::keys::KEY_LENGTH;
use calvault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Domain separator for credential associated data.
const CREDENTIAL_AD_DOMAIN: &[u8] = b"calvault-credential-v1";

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Build the associated data that binds a credential to its owner.
///
/// Fields are length-prefixed so that no two (label, provider, version)
/// triples encode to the same bytes.
pub fn credential_associated_data(label: &str, provider: &str, key_version: u32) -> Vec<u8> {
    let mut ad = Vec::with_capacity(CREDENTIAL_AD_DOMAIN.len() + label.len() + provider.len() + 16);
    ad.extend_from_slice(CREDENTIAL_AD_DOMAIN);
    for field in [label.as_bytes(), provider.as_bytes()] {
        ad.extend_from_slice(&(field.len() as u32).to_be_bytes());
        ad.extend_from_slice(field);
    }
    ad.extend_from_slice(&key_version.to_be_bytes());
    ad
}

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| Error::InvalidInput(format!("Invalid key: {}", e)))
}

/// Encrypt plaintext bound to `associated_data`.
///
/// # Postconditions
/// - A fresh random nonce is drawn for every call
/// - `ciphertext.len() == plaintext.len()`
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt(key: &[u8], plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed> {
    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = match cipher.encrypt_in_place_detached(&nonce, associated_data, &mut buffer) {
        Ok(tag) => tag,
        Err(e) => {
            buffer.zeroize();
            return Err(Error::InvalidInput(format!("Encryption failed: {}", e)));
        }
    };

    let mut sealed = Sealed {
        nonce: [0u8; NONCE_SIZE],
        ciphertext: buffer,
        tag: [0u8; TAG_SIZE],
    };
    sealed.nonce.copy_from_slice(&nonce);
    sealed.tag.copy_from_slice(&tag);
    Ok(sealed)
}

/// Decrypt and authenticate a sealed payload.
///
/// # Errors
/// - Returns `Integrity` if the tag does not verify under `key` and
///   `associated_data`. No plaintext is returned in that case.
///
/// # Security
/// - Authenticates before releasing any plaintext
/// - The returned buffer zeroizes on drop
pub fn decrypt(key: &[u8], sealed: &Sealed, associated_data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = cipher(key)?;
    let nonce = XNonce::from_slice(&sealed.nonce);
    let tag = Tag::from_slice(&sealed.tag);

    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(nonce, associated_data, buffer.as_mut_slice(), tag)
        .map_err(|_| Error::Integrity("Authentication tag mismatch".to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const KEY: [u8; KEY_LENGTH] = [42u8; KEY_LENGTH];

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let ad = credential_associated_data("Personal", "icloud", 1);
        let sealed = encrypt(&KEY, b"Hello, World!", &ad).unwrap();
        let decrypted = decrypt(&KEY, &sealed, &ad).unwrap();

        assert_eq!(decrypted.as_slice(), b"Hello, World!");
        assert_eq!(sealed.ciphertext.len(), b"Hello, World!".len());
    }

    #[test]
    fn test_wrong_key_fails() {
        let ad = credential_associated_data("Personal", "icloud", 1);
        let sealed = encrypt(&[1u8; KEY_LENGTH], b"Secret data", &ad).unwrap();

        let result = decrypt(&[2u8; KEY_LENGTH], &sealed, &ad);
        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    #[test]
    fn test_swapped_account_fails() {
        let personal = credential_associated_data("Personal", "icloud", 1);
        let work = credential_associated_data("Work", "icloud", 1);
        let sealed = encrypt(&KEY, b"app-specific-pw", &personal).unwrap();

        assert!(matches!(decrypt(&KEY, &sealed, &work), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_key_version_is_bound() {
        let v1 = credential_associated_data("Personal", "google", 1);
        let v2 = credential_associated_data("Personal", "google", 2);
        let sealed = encrypt(&KEY, b"token", &v1).unwrap();

        assert!(decrypt(&KEY, &sealed, &v2).is_err());
    }

    #[test]
    fn test_associated_data_is_unambiguous() {
        // Same concatenation, different field split
        let a = credential_associated_data("ab", "cd", 1);
        let b = credential_associated_data("a", "bcd", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            encrypt(&[0u8; 16], b"data", b""),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let sealed = encrypt(&KEY, b"", b"ad").unwrap();
        let decrypted = decrypt(&KEY, &sealed, b"ad").unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_nonces_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let sealed = encrypt(&KEY, b"same plaintext", b"ad").unwrap();
            assert!(seen.insert(sealed.nonce), "nonce repeated");
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            ad in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let sealed = encrypt(&KEY, &plaintext, &ad).unwrap();
            let decrypted = decrypt(&KEY, &sealed, &ad).unwrap();
            prop_assert_eq!(decrypted.as_slice(), plaintext.as_slice());
        }

        #[test]
        fn prop_bit_flip_fails_closed(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            ad in proptest::collection::vec(any::<u8>(), 1..64),
            target in 0usize..4,
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let mut sealed = encrypt(&KEY, &plaintext, &ad).unwrap();
            let mut ad = ad;
            let mask = 1u8 << bit;

            match target {
                0 => {
                    let i = position % sealed.ciphertext.len();
                    sealed.ciphertext[i] ^= mask;
                }
                1 => sealed.nonce[position % NONCE_SIZE] ^= mask,
                2 => sealed.tag[position % TAG_SIZE] ^= mask,
                _ => {
                    let i = position % ad.len();
                    ad[i] ^= mask;
                }
            }

            let result = decrypt(&KEY, &sealed, &ad);
            prop_assert!(matches!(result, Err(Error::Integrity(_))));
        }
    }
}
