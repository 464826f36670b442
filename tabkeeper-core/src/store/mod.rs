//! Durable key-value storage consumed by the sync core.
//!
//! Values are JSON. Subsystems share one backing store through disjoint
//! key namespaces ([`Namespaced`]): `collections`, `sync`, `crypto` and `account`.

pub mod account;
pub mod collections;
pub mod memory;
pub mod sqlite;

pub use account::AccountStore;
pub use collections::{CollectionRead, CollectionStore, UnreadableRecord};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Namespace holding record collections.
pub const COLLECTIONS_NAMESPACE: &str = "collections";
/// Namespace holding per-collection sync state.
pub const SYNC_NAMESPACE: &str = "sync";
/// Namespace holding the sealing key.
pub const CRYPTO_NAMESPACE: &str = "crypto";
/// Namespace holding the sealed relay account token.
pub const ACCOUNT_NAMESPACE: &str = "account";

/// Errors surfaced by a [`LocalStore`] backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Stored value could not be (de)serialized: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Durable, namespace-isolated key-value storage.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch the given keys; absent keys are omitted from the map.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StoreError>;

    /// Write all entries atomically.
    async fn set(&self, entries: HashMap<String, Value>) -> Result<(), StoreError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError>;
}

/// Prefixes every key with `"{namespace}/"` so subsystems sharing one
/// backend never see each other's keys.
#[derive(Clone)]
pub struct Namespaced {
    inner: Arc<dyn LocalStore>,
    prefix: String,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn LocalStore>, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}/", namespace),
        }
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl LocalStore for Namespaced {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StoreError> {
        let qualified: Vec<String> = keys.iter().map(|k| self.qualify(k)).collect();
        let refs: Vec<&str> = qualified.iter().map(String::as_str).collect();
        let found = self.inner.get(&refs).await?;

        Ok(found
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&self.prefix).map(|s| (s.to_string(), v)))
            .collect())
    }

    async fn set(&self, entries: HashMap<String, Value>) -> Result<(), StoreError> {
        let qualified = entries
            .into_iter()
            .map(|(k, v)| (self.qualify(&k), v))
            .collect();
        self.inner.set(qualified).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        let qualified: Vec<String> = keys.iter().map(|k| self.qualify(k)).collect();
        let refs: Vec<&str> = qualified.iter().map(String::as_str).collect();
        self.inner.remove(&refs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let backend: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let sync = Namespaced::new(backend.clone(), SYNC_NAMESPACE);
        let crypto = Namespaced::new(backend.clone(), CRYPTO_NAMESPACE);

        sync.set(HashMap::from([("k".to_string(), json!(1))]))
            .await
            .unwrap();
        crypto
            .set(HashMap::from([("k".to_string(), json!(2))]))
            .await
            .unwrap();

        assert_eq!(sync.get(&["k"]).await.unwrap()["k"], json!(1));
        assert_eq!(crypto.get(&["k"]).await.unwrap()["k"], json!(2));

        let raw = backend.get(&["sync/k", "crypto/k"]).await.unwrap();
        assert_eq!(raw.len(), 2);

        sync.remove(&["k"]).await.unwrap();
        assert!(sync.get(&["k"]).await.unwrap().is_empty());
        assert_eq!(crypto.get(&["k"]).await.unwrap()["k"], json!(2));
    }
}
