//! Sealing key persistence.
//!
//! The key is generated on first run and stored base64-encoded in the
//! `crypto` namespace of the local store. It is never transmitted. Losing
//! it makes every previously sealed payload permanently unreadable; there
//! is no recovery path, so a present-but-unreadable key is reported as
//! [`CryptoError::KeyCorrupted`] instead of being silently replaced.

use crate::crypto::cipher::SealingKey;
use crate::crypto::{CryptoError, Result};
use crate::store::LocalStore;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Key under which the sealing key lives inside the crypto namespace.
pub const SEALING_KEY_SLOT: &str = "sealing_key";

/// Load the sealing key, generating and persisting one if none exists.
pub async fn load_or_create_key(store: &dyn LocalStore) -> Result<SealingKey> {
    let found = store
        .get(&[SEALING_KEY_SLOT])
        .await
        .map_err(|e| CryptoError::KeyStorage(e.to_string()))?;

    if let Some(value) = found.get(SEALING_KEY_SLOT) {
        return decode_key(value);
    }

    let key = SealingKey::generate();
    let encoded = STANDARD.encode(key.as_bytes());
    store
        .set(HashMap::from([(
            SEALING_KEY_SLOT.to_string(),
            Value::String(encoded),
        )]))
        .await
        .map_err(|e| CryptoError::KeyStorage(e.to_string()))?;

    info!("Generated new sealing key");
    Ok(key)
}

fn decode_key(value: &Value) -> Result<SealingKey> {
    let encoded = value
        .as_str()
        .ok_or_else(|| CryptoError::KeyCorrupted("stored key is not a string".to_string()))?;

    let mut bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::KeyCorrupted(format!("invalid base64: {}", e)))?;

    let key: [u8; 32] = match bytes.as_slice().try_into() {
        Ok(key) => key,
        Err(_) => {
            warn!(len = bytes.len(), "Stored sealing key has the wrong length");
            zeroize::Zeroize::zeroize(&mut bytes);
            return Err(CryptoError::KeyCorrupted(
                "expected a 32-byte key".to_string(),
            ));
        }
    };
    zeroize::Zeroize::zeroize(&mut bytes);

    Ok(SealingKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoBox;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn key_is_generated_once_and_reused() {
        let store = MemoryStore::new();

        let first = load_or_create_key(&store).await.unwrap();
        let second = load_or_create_key(&store).await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        // Sealed with the first load, opened with the second.
        let blob = CryptoBox::new(first).encrypt(b"payload").unwrap();
        assert_eq!(CryptoBox::new(second).decrypt(&blob).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn corrupted_key_is_fatal_not_regenerated() {
        let store = MemoryStore::new();
        store
            .set(HashMap::from([(
                SEALING_KEY_SLOT.to_string(),
                json!(STANDARD.encode([1u8; 7])),
            )]))
            .await
            .unwrap();

        let err = load_or_create_key(&store).await.unwrap_err();
        assert!(matches!(err, CryptoError::KeyCorrupted(_)));

        // The bad value is left in place for inspection.
        assert!(store.snapshot().contains_key(SEALING_KEY_SLOT));
    }

    #[tokio::test]
    async fn non_string_key_is_corrupted() {
        let store = MemoryStore::new();
        store
            .set(HashMap::from([(SEALING_KEY_SLOT.to_string(), json!(42))]))
            .await
            .unwrap();

        assert!(matches!(
            load_or_create_key(&store).await,
            Err(CryptoError::KeyCorrupted(_))
        ));
    }
}
