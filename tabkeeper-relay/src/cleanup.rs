//! Background cleanup: prune idle accounts, old tombstones and stale rate windows.

use crate::config::RelayConfig;
use crate::server::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub account_days: u64,
    pub tombstone_days: Option<u64>,
}

impl From<&RelayConfig> for Retention {
    fn from(config: &RelayConfig) -> Self {
        Self {
            account_days: config.account_retention_days,
            tombstone_days: config.tombstone_retention_days,
        }
    }
}

pub fn spawn_cleanup_task(state: AppState, retention: Retention) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(3600)); // hourly
        loop {
            interval.tick().await;
            if let Err(e) = run_cleanup(&state, retention, chrono::Utc::now().timestamp_millis()) {
                tracing::error!("Cleanup error: {}", e);
            }
        }
    })
}

fn run_cleanup(state: &AppState, retention: Retention, now: i64) -> Result<(), String> {
    let account_cutoff = now - retention.account_days as i64 * DAY_MS;
    let accounts = state
        .storage
        .prune_inactive_accounts(account_cutoff)
        .map_err(|e| e.to_string())?;

    let tombstones = match retention.tombstone_days {
        Some(days) => state
            .storage
            .prune_tombstones(now - days as i64 * DAY_MS)
            .map_err(|e| e.to_string())?,
        None => 0,
    };

    let windows = state.limiter.sweep(now);

    tracing::debug!(accounts, tombstones, windows, "Cleanup completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelayStorage;
    use serde_json::json;
    use tabkeeper_core::Collection;

    fn state() -> AppState {
        AppState::new(RelayStorage::in_memory().unwrap(), &RelayConfig::default())
    }

    #[test]
    fn idle_accounts_are_pruned() {
        let state = state();
        let now = 400 * DAY_MS;
        state.storage.create_account("idle", "h1", now - 200 * DAY_MS).unwrap();
        state.storage.create_account("active", "h2", now - DAY_MS).unwrap();

        let retention = Retention { account_days: 180, tombstone_days: None };
        run_cleanup(&state, retention, now).unwrap();

        assert!(state.storage.account_by_token_hash("h1").unwrap().is_none());
        assert!(state.storage.account_by_token_hash("h2").unwrap().is_some());
    }

    #[test]
    fn tombstones_survive_when_retention_is_off() {
        let state = state();
        let now = 400 * DAY_MS;
        state.storage.create_account("a", "h", now).unwrap();
        state
            .storage
            .replace_collections(
                "a",
                &[(Collection::Tasks, vec![json!({"id": "x", "deleted": true, "lastModified": 1})])],
                now,
            )
            .unwrap();

        run_cleanup(&state, Retention { account_days: 180, tombstone_days: None }, now).unwrap();
        assert_eq!(state.storage.load_collection("a", Collection::Tasks).unwrap().len(), 1);

        run_cleanup(&state, Retention { account_days: 180, tombstone_days: Some(30) }, now).unwrap();
        assert!(state.storage.load_collection("a", Collection::Tasks).unwrap().is_empty());
    }
}
