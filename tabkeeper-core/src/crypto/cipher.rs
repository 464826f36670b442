//! AES-256-GCM sealing of opaque payloads.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key
//! - 96-bit (12 byte) nonce, freshly drawn from the OS RNG on every call
//! - 128-bit authentication tag

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric key used by [`CryptoBox`].
///
/// Generated once on first run and kept in the local store; it never
/// leaves the device.
#[derive(Clone)]
pub struct SealingKey {
    key: [u8; 32],
}

impl SealingKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Create a key from raw bytes (use with caution)
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for SealingKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

/// A sealed payload: nonce, ciphertext and authentication tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
}

/// Authenticated symmetric encryption bound to one [`SealingKey`].
#[derive(Clone)]
pub struct CryptoBox {
    key: SealingKey,
}

impl CryptoBox {
    pub fn new(key: SealingKey) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let cipher = Aes256Gcm::new(self.key.as_bytes().into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let nonce_bytes: [u8; NONCE_LEN] = nonce.into();

        // aes-gcm appends the tag to the ciphertext
        let mut sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        if sealed.len() < TAG_LEN {
            return Err(CryptoError::EncryptionFailed(
                "Ciphertext too short - missing auth tag".to_string(),
            ));
        }
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedBlob {
            iv: nonce_bytes.to_vec(),
            ciphertext: sealed,
            tag,
        })
    }

    /// Decrypt and verify `blob`.
    ///
    /// Any tampering, truncation or key mismatch yields
    /// [`CryptoError::Integrity`].
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>> {
        if blob.iv.len() != NONCE_LEN || blob.tag.len() != TAG_LEN {
            return Err(CryptoError::Integrity);
        }

        let cipher = Aes256Gcm::new(self.key.as_bytes().into());
        let nonce = Nonce::from_slice(&blob.iv);

        let mut ciphertext_with_tag = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
        ciphertext_with_tag.extend_from_slice(&blob.ciphertext);
        ciphertext_with_tag.extend_from_slice(&blob.tag);

        cipher
            .decrypt(nonce, ciphertext_with_tag.as_slice())
            .map_err(|_| CryptoError::Integrity)
    }

    /// Serialize `value` to JSON and seal it.
    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<EncryptedBlob> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CryptoError::Serialization(e.to_string()))?;
        self.encrypt(&bytes)
    }

    /// Open a blob produced by [`CryptoBox::seal_json`].
    pub fn open_json<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Result<T> {
        let bytes = self.decrypt(blob)?;
        serde_json::from_slice(&bytes).map_err(|e| CryptoError::Serialization(e.to_string()))
    }
}

/// Base64 serialization for `Vec<u8>` fields.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
