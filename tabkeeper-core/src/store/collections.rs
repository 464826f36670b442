//! Record collections persisted through a [`LocalStore`].
//!
//! Each collection is one JSON array under its wire name in the
//! `collections` namespace. Collections configured as sensitive keep their
//! merge metadata in clear and seal the payload with [`CryptoBox`].

use crate::clock::Clock;
use crate::crypto::{CryptoBox, EncryptedBlob};
use crate::store::{LocalStore, Namespaced, StoreError, COLLECTIONS_NAMESPACE, SYNC_NAMESPACE};
use crate::sync::conflict::ConflictResolver;
use crate::sync::models::{Collection, Record, SyncState};
use crate::{Result, TabkeeperError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// On-disk form of a record from a sealed collection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedRecord {
    id: String,
    last_modified: Option<i64>,
    version: Option<u64>,
    deleted: bool,
    sealed: EncryptedBlob,
}

impl SealedRecord {
    /// Clear-text merge metadata with an empty payload.
    fn metadata(&self) -> Record {
        Record {
            id: self.id.clone(),
            last_modified: self.last_modified,
            version: self.version,
            deleted: self.deleted,
            payload: Map::new(),
        }
    }
}

/// A stored entry whose sealed payload failed authentication. The raw entry
/// is written back untouched until a newer version replaces it.
#[derive(Debug, Clone)]
pub struct UnreadableRecord {
    pub metadata: Record,
    raw: Value,
}

/// Result of reading one collection.
#[derive(Debug, Default)]
pub struct CollectionRead {
    pub records: Vec<Record>,
    /// Ids whose sealed payload failed authentication. They are skipped.
    pub integrity_failures: Vec<String>,
    /// The stored entries behind `integrity_failures`.
    pub unreadable: Vec<UnreadableRecord>,
    /// Stored entries that no longer parse as records.
    pub rejected: usize,
}

pub struct CollectionStore {
    records: Namespaced,
    state: Namespaced,
    crypto: CryptoBox,
    sealed: HashSet<Collection>,
    clock: Arc<dyn Clock>,
    // Serializes read-modify-write cycles so a UI edit landing during a
    // sync persist is merged instead of overwritten.
    write_lock: Mutex<()>,
}

impl CollectionStore {
    pub fn new(
        backend: Arc<dyn LocalStore>,
        crypto: CryptoBox,
        sealed: impl IntoIterator<Item = Collection>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: Namespaced::new(backend.clone(), COLLECTIONS_NAMESPACE),
            state: Namespaced::new(backend, SYNC_NAMESPACE),
            crypto,
            sealed: sealed.into_iter().collect(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn crypto(&self) -> &CryptoBox {
        &self.crypto
    }

    pub fn is_sealed(&self, collection: Collection) -> bool {
        self.sealed.contains(&collection)
    }

    /// Read one collection, skipping entries that fail integrity checks.
    pub async fn read(&self, collection: Collection) -> Result<CollectionRead> {
        let key = collection.as_str();
        let mut found = self.records.get(&[key]).await?;
        let stored = match found.remove(key) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(StoreError::Serialization(format!(
                    "collection {} is not an array: {}",
                    collection, other
                ))
                .into())
            }
            None => return Ok(CollectionRead::default()),
        };

        let mut read = CollectionRead::default();
        for item in stored {
            let parsed = if item.get("sealed").is_some() {
                self.open_record(&item)
            } else {
                Record::from_value(item.clone(), collection)
            };

            match parsed {
                Ok(record) => read.records.push(record),
                Err(TabkeeperError::Integrity(id)) => {
                    warn!(%collection, %id, "Skipping record that failed integrity check");
                    read.integrity_failures.push(id);
                    if let Ok(sealed) = SealedRecord::deserialize(&item) {
                        read.unreadable.push(UnreadableRecord {
                            metadata: sealed.metadata(),
                            raw: item,
                        });
                    }
                }
                Err(e) => {
                    warn!(%collection, error = %e, "Dropping unreadable stored record");
                    read.rejected += 1;
                }
            }
        }
        Ok(read)
    }

    /// Read every collection.
    pub async fn read_all(&self) -> Result<BTreeMap<Collection, CollectionRead>> {
        let mut all = BTreeMap::new();
        for collection in Collection::ALL {
            all.insert(collection, self.read(collection).await?);
        }
        Ok(all)
    }

    /// Active (non-tombstone) records of a collection.
    pub async fn list_active(&self, collection: Collection) -> Result<Vec<Record>> {
        Ok(self
            .read(collection)
            .await?
            .records
            .into_iter()
            .filter(|r| !r.deleted)
            .collect())
    }

    /// Merge `incoming` into what is currently stored and write the result
    /// of every collection in one atomic store write.
    ///
    /// Entries that fail integrity checks take part in the merge through
    /// their clear-text metadata. While that metadata wins they are written
    /// back verbatim. Returns the records to publish: every readable
    /// persisted record, the metadata of unreadable tombstones, and the
    /// incoming copy of unreadable active records.
    pub async fn persist_merged(
        &self,
        incoming: &BTreeMap<Collection, Vec<Record>>,
    ) -> Result<BTreeMap<Collection, Vec<Record>>> {
        let _guard = self.write_lock.lock().await;

        let mut published = BTreeMap::new();
        let mut entries = HashMap::new();
        for (collection, records) in incoming {
            let current = self.read(*collection).await?;
            let mut local = current.records;
            local.extend(current.unreadable.iter().map(|u| u.metadata.clone()));
            let mut merged = ConflictResolver::merge(&local, records);

            let mut kept = Vec::new();
            for unreadable in current.unreadable {
                let Some(i) = merged.iter().position(|r| r.id == unreadable.metadata.id) else {
                    continue;
                };
                if merged[i] == unreadable.metadata {
                    merged.remove(i);
                    kept.push(unreadable);
                }
            }

            entries.insert(
                collection.as_str().to_string(),
                self.encode_collection(*collection, &merged, &kept)?,
            );

            for unreadable in kept {
                if unreadable.metadata.deleted {
                    merged.push(unreadable.metadata);
                } else if let Some(remote) = records.iter().find(|r| r.id == unreadable.metadata.id) {
                    merged.push(remote.clone());
                }
            }
            merged.sort_by(|a, b| a.id.cmp(&b.id));
            published.insert(*collection, merged);
        }

        self.records.set(entries).await?;
        debug!(collections = published.len(), "Persisted merged collections");
        Ok(published)
    }

    /// Create or edit a record from the UI.
    ///
    /// Stamps `last_modified = max(now, previous + 1)` and bumps `version`,
    /// so an edit always supersedes what it replaces.
    pub async fn upsert(
        &self,
        collection: Collection,
        id: &str,
        payload: Map<String, Value>,
    ) -> Result<Record> {
        let id = self.effective_id(collection, id)?;
        self.modify(collection, &id, |_, stamp, version| Record {
            id: id.clone(),
            last_modified: Some(stamp),
            version: Some(version),
            deleted: false,
            payload,
        })
        .await
    }

    /// Soft-delete a record into a tombstone. The tombstone is written even
    /// when the id is unknown locally so the deletion still propagates.
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<Record> {
        let id = self.effective_id(collection, id)?;
        self.modify(collection, &id, |_, stamp, version| Record {
            id: id.clone(),
            last_modified: Some(stamp),
            version: Some(version),
            deleted: true,
            payload: Map::new(),
        })
        .await
    }

    async fn modify<F>(&self, collection: Collection, id: &str, build: F) -> Result<Record>
    where
        F: FnOnce(Option<&Record>, i64, u64) -> Record,
    {
        let _guard = self.write_lock.lock().await;

        let current = self.read(collection).await?;
        let mut records = current.records;
        // An explicit edit replaces an unreadable entry of the same id.
        let (replaced, kept): (Vec<_>, Vec<_>) = current
            .unreadable
            .into_iter()
            .partition(|u| u.metadata.id == id);
        let position = records.iter().position(|r| r.id == id);
        let previous = position
            .map(|i| &records[i])
            .or_else(|| replaced.first().map(|u| &u.metadata));

        let now = self.clock.now_ms();
        let stamp = match previous.and_then(|p| p.last_modified) {
            Some(prev) if prev >= now => prev.saturating_add(1),
            _ => now,
        };
        let version = previous.and_then(|p| p.version).unwrap_or(0) + 1;
        let record = build(previous, stamp, version);

        match position {
            Some(i) => records[i] = record.clone(),
            None => records.push(record.clone()),
        }

        let encoded = self.encode_collection(collection, &records, &kept)?;
        self.records
            .set(HashMap::from([(collection.as_str().to_string(), encoded)]))
            .await?;
        Ok(record)
    }

    fn effective_id(&self, collection: Collection, id: &str) -> Result<String> {
        if collection.is_singleton() {
            return Ok(collection.as_str().to_string());
        }
        if id.trim().is_empty() {
            return Err(TabkeeperError::Validation(format!(
                "{} record needs a non-empty id",
                collection
            )));
        }
        Ok(id.to_string())
    }

    pub async fn sync_state(&self, collection: Collection) -> Result<SyncState> {
        let key = state_key(collection);
        let found = self.state.get(&[&key]).await?;
        match found.get(&key) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Serialization(e.to_string()).into()),
            None => Ok(SyncState::default()),
        }
    }

    pub async fn set_sync_state(&self, collection: Collection, state: SyncState) -> Result<()> {
        let value =
            serde_json::to_value(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.state
            .set(HashMap::from([(state_key(collection), value)]))
            .await?;
        Ok(())
    }

    fn encode_collection(
        &self,
        collection: Collection,
        records: &[Record],
        unreadable: &[UnreadableRecord],
    ) -> Result<Value> {
        let sealed = self.is_sealed(collection);
        let mut items = Vec::with_capacity(records.len() + unreadable.len());
        for record in records {
            items.push(if sealed {
                self.seal_record(record)?
            } else {
                record.to_value()
            });
        }
        items.extend(unreadable.iter().map(|u| u.raw.clone()));
        Ok(Value::Array(items))
    }

    fn seal_record(&self, record: &Record) -> Result<Value> {
        let sealed = SealedRecord {
            id: record.id.clone(),
            last_modified: record.last_modified,
            version: record.version,
            deleted: record.deleted,
            sealed: self.crypto.seal_json(&record.payload)?,
        };
        serde_json::to_value(sealed).map_err(|e| StoreError::Serialization(e.to_string()).into())
    }

    fn open_record(&self, item: &Value) -> Result<Record> {
        let sealed = SealedRecord::deserialize(item)
            .map_err(|e| TabkeeperError::Validation(format!("sealed record: {}", e)))?;

        let payload: Map<String, Value> = self
            .crypto
            .open_json(&sealed.sealed)
            .map_err(|_| TabkeeperError::Integrity(sealed.id.clone()))?;

        Ok(Record {
            id: sealed.id,
            last_modified: sealed.last_modified,
            version: sealed.version,
            deleted: sealed.deleted,
            payload,
        })
    }
}

fn state_key(collection: Collection) -> String {
    format!("state.{}", collection.as_str())
}
