//! On-disk encrypted credential record.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use calvault_common::{CredentialPayload, Error, ProviderKind, Result};
use calvault_crypto::{credential_associated_data, decrypt, encrypt, MasterKey, Sealed};
use calvault_crypto::{NONCE_SIZE, TAG_SIZE};

/// Current record format version.
pub const RECORD_FORMAT: u32 = 1;

/// File extension of credential records.
pub const RECORD_EXTENSION: &str = "cred";

/// An encrypted credential as stored on disk.
///
/// Holds no plaintext. The label, provider and key version travel in the
/// clear but are authenticated through the associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    /// Record format version.
    pub format: u32,
    /// Provider the credential belongs to.
    pub provider: ProviderKind,
    /// Account label.
    pub label: String,
    /// Version of the master key the record is sealed under.
    pub key_version: u32,
    #[serde(with = "b64")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: [u8; TAG_SIZE],
}

impl EncryptedCredential {
    /// Encrypt a payload for an account.
    pub fn seal(
        key: &MasterKey,
        label: &str,
        provider: ProviderKind,
        payload: &CredentialPayload,
    ) -> Result<Self> {
        if payload.provider() != provider {
            return Err(Error::InvalidInput(format!(
                "{} credential cannot be stored for a {} account",
                payload.provider(),
                provider
            )));
        }

        let plaintext = zeroize::Zeroizing::new(payload.to_bytes()?);
        let ad = credential_associated_data(label, provider.as_str(), key.version());
        let Sealed {
            nonce,
            ciphertext,
            tag,
        } = encrypt(key.as_bytes(), &plaintext, &ad)?;

        Ok(Self {
            format: RECORD_FORMAT,
            provider,
            label: label.to_string(),
            key_version: key.version(),
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Decrypt the payload.
    ///
    /// # Errors
    /// - `Integrity` if the record was tampered with, belongs to another
    ///   account, or was sealed under a different key
    pub fn open(&self, key: &MasterKey) -> Result<CredentialPayload> {
        let ad = credential_associated_data(&self.label, self.provider.as_str(), self.key_version);
        let sealed = Sealed {
            nonce: self.nonce,
            ciphertext: self.ciphertext.clone(),
            tag: self.tag,
        };
        let plaintext = decrypt(key.as_bytes(), &sealed, &ad)?;

        let payload = CredentialPayload::from_bytes(&plaintext)
            .map_err(|_| Error::Integrity("Decrypted payload is malformed".to_string()))?;
        if payload.provider() != self.provider {
            return Err(Error::Integrity(
                "Payload does not match record provider".to_string(),
            ));
        }
        Ok(payload)
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from JSON bytes.
    ///
    /// A record that does not parse is treated as corruption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::Integrity(format!("Corrupted credential record: {}", e)))?;
        if record.format != RECORD_FORMAT {
            return Err(Error::Integrity(format!(
                "Unsupported record format {}",
                record.format
            )));
        }
        Ok(record)
    }

    /// File name of the record for `label`.
    pub fn file_name(label: &str) -> String {
        format!("{}.{}", URL_SAFE_NO_PAD.encode(label), RECORD_EXTENSION)
    }

    /// Recover the label from a record file name.
    pub fn label_from_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(&format!(".{}", RECORD_EXTENSION))?;
        let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

mod b64 {
    use super::{Engine, STANDARD};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| de::Error::custom(format!("unexpected length {}", len)))
    }
}
