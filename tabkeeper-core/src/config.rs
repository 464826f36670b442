//! Host configuration loaded from TOML.

use crate::platform;
use crate::sync::backoff::Backoff;
use crate::sync::models::Collection;
use crate::{Result, TabkeeperError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabkeeperConfig {
    pub data_dir: PathBuf,
    /// Base URL of the sync relay.
    pub relay_url: String,
    pub sync: SyncSettings,
    pub gateway: GatewaySettings,
}

impl Default for TabkeeperConfig {
    fn default() -> Self {
        Self {
            data_dir: platform::get_data_dir(),
            relay_url: "http://127.0.0.1:8743".to_string(),
            sync: SyncSettings::default(),
            gateway: GatewaySettings::default(),
        }
    }
}

impl TabkeeperConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TabkeeperError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            return Err(TabkeeperError::Config(
                "sync.interval_secs must be positive".to_string(),
            ));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(TabkeeperError::Config(
                "sync.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sync.backoff_base_secs == 0 || self.sync.backoff_cap_secs < self.sync.backoff_base_secs {
            return Err(TabkeeperError::Config(
                "sync backoff needs 0 < backoff_base_secs <= backoff_cap_secs".to_string(),
            ));
        }
        if self.gateway.max_requests == 0 || self.gateway.window_ms <= 0 {
            return Err(TabkeeperError::Config(
                "gateway rate limit must allow at least one request per window".to_string(),
            ));
        }
        if self.gateway.token_ttl_ms <= 0 {
            return Err(TabkeeperError::Config(
                "gateway.token_ttl_ms must be positive".to_string(),
            ));
        }
        if self.gateway.sweep_interval_ms == 0 {
            return Err(TabkeeperError::Config(
                "gateway.sweep_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        platform::store_path(&self.data_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Period of the scheduled sync.
    pub interval_secs: u64,
    /// Bound on every call to the sync endpoint.
    pub request_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Collections whose payloads are sealed at rest.
    pub sealed_collections: Vec<Collection>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            request_timeout_secs: 30,
            backoff_base_secs: 5,
            backoff_cap_secs: 5 * 60,
            sealed_collections: vec![Collection::ActivityLogs],
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub token_ttl_ms: i64,
    pub max_requests: u32,
    pub window_ms: i64,
    pub sweep_interval_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            token_ttl_ms: 5 * 60 * 1000,
            max_requests: 100,
            window_ms: 15 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}
