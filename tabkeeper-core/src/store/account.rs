//! Sealed persistence of the relay account token.

use crate::crypto::{CryptoBox, EncryptedBlob};
use crate::store::{LocalStore, Namespaced, ACCOUNT_NAMESPACE};
use crate::{Result, TabkeeperError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const TOKEN_SLOT: &str = "token";

/// The bearer token is stored sealed, so a copied database alone does not
/// grant access to the relay account.
#[derive(Clone)]
pub struct AccountStore {
    store: Namespaced,
    crypto: CryptoBox,
}

impl AccountStore {
    pub fn new(backend: Arc<dyn LocalStore>, crypto: CryptoBox) -> Self {
        Self {
            store: Namespaced::new(backend, ACCOUNT_NAMESPACE),
            crypto,
        }
    }

    pub async fn load_token(&self) -> Result<Option<String>> {
        let found = self.store.get(&[TOKEN_SLOT]).await?;
        let Some(value) = found.get(TOKEN_SLOT) else {
            return Ok(None);
        };

        let blob: EncryptedBlob = serde_json::from_value(value.clone())
            .map_err(|e| TabkeeperError::Integrity(format!("stored token: {}", e)))?;
        Ok(Some(self.crypto.open_json(&blob)?))
    }

    pub async fn save_token(&self, token: &str) -> Result<()> {
        let blob = self.crypto.seal_json(&token)?;
        let value = serde_json::to_value(&blob)
            .map_err(|e| TabkeeperError::Validation(e.to_string()))?;
        self.store
            .set(HashMap::from([(TOKEN_SLOT.to_string(), value)]))
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(&[TOKEN_SLOT]).await?;
        Ok(())
    }
}
