//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    pub max_payload_size: usize,
    pub max_records_per_collection: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub account_retention_days: u64,
    /// Purge tombstones older than this many days. Disabled when unset.
    pub tombstone_retention_days: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8743".to_string(),
            storage_path: PathBuf::from("relay.db"),
            max_payload_size: 4 * 1024 * 1024,
            max_records_per_collection: 50_000,
            rate_limit_requests: 120,
            rate_limit_window_secs: 60,
            account_retention_days: 180,
            tombstone_retention_days: None,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }
}
