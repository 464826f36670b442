//! SQLite storage backend for the relay.

pub mod models;

use crate::error::RelayError;
use models::StoredAccount;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tabkeeper_core::Collection;

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                token_hash TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS collections (
                account_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                records TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, collection),
                FOREIGN KEY (account_id) REFERENCES accounts(account_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_last_seen
                ON accounts(last_seen);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    pub fn create_account(&self, account_id: &str, token_hash: &str, now: i64) -> Result<(), RelayError> {
        self.conn()?.execute(
            "INSERT INTO accounts (account_id, token_hash, created_at, last_seen)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![account_id, token_hash, now],
        )?;
        Ok(())
    }

    pub fn account_by_token_hash(&self, token_hash: &str) -> Result<Option<StoredAccount>, RelayError> {
        let account = self
            .conn()?
            .query_row(
                "SELECT account_id, last_seen FROM accounts WHERE token_hash = ?1",
                [token_hash],
                |row| {
                    Ok(StoredAccount {
                        account_id: row.get(0)?,
                        last_seen: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Record activity; returns the new `last_seen`.
    pub fn touch(&self, account_id: &str, now: i64) -> Result<i64, RelayError> {
        let updated = self.conn()?.execute(
            "UPDATE accounts SET last_seen = ?2 WHERE account_id = ?1",
            rusqlite::params![account_id, now],
        )?;
        if updated == 0 {
            return Err(RelayError::NotFound("Account not found".to_string()));
        }
        Ok(now)
    }

    pub fn load_collection(&self, account_id: &str, collection: Collection) -> Result<Vec<Value>, RelayError> {
        let stored: Option<String> = self
            .conn()?
            .query_row(
                "SELECT records FROM collections WHERE account_id = ?1 AND collection = ?2",
                rusqlite::params![account_id, collection.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the given collections in one transaction.
    pub fn replace_collections(
        &self,
        account_id: &str,
        collections: &[(Collection, Vec<Value>)],
        now: i64,
    ) -> Result<(), RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (collection, records) in collections {
            tx.execute(
                "INSERT INTO collections (account_id, collection, records, record_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id, collection) DO UPDATE SET
                    records = excluded.records,
                    record_count = excluded.record_count,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    account_id,
                    collection.as_str(),
                    serde_json::to_string(records)?,
                    records.len() as i64,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete accounts idle since before `cutoff` along with their data.
    pub fn prune_inactive_accounts(&self, cutoff: i64) -> Result<usize, RelayError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM accounts WHERE last_seen < ?1", [cutoff])?;
        Ok(removed)
    }

    /// Drop tombstones whose `lastModified` is older than `cutoff`.
    /// Returns how many records were removed.
    pub fn prune_tombstones(&self, cutoff: i64) -> Result<usize, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<(String, String, String)> = {
            let mut stmt = tx.prepare("SELECT account_id, collection, records FROM collections")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut removed = 0;
        for (account_id, collection, json) in rows {
            let records: Vec<Value> = serde_json::from_str(&json)?;
            let before = records.len();
            let kept: Vec<Value> = records
                .into_iter()
                .filter(|record| !is_expired_tombstone(record, cutoff))
                .collect();
            if kept.len() == before {
                continue;
            }
            removed += before - kept.len();
            tx.execute(
                "UPDATE collections SET records = ?3, record_count = ?4
                 WHERE account_id = ?1 AND collection = ?2",
                rusqlite::params![account_id, collection, serde_json::to_string(&kept)?, kept.len() as i64],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn is_expired_tombstone(record: &Value, cutoff: i64) -> bool {
    let deleted = record.get("deleted").and_then(Value::as_bool).unwrap_or(false);
    let last_modified = record.get("lastModified").and_then(Value::as_i64);
    deleted && last_modified.is_some_and(|lm| lm < cutoff)
}
