//! Periodic sync trigger.

use crate::sync::engine::{SyncOrchestrator, SyncReason};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Fires a scheduled sync on a fixed period until stopped.
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    timer: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Start the periodic timer. The first scheduled cycle fires one full
    /// period after start.
    pub fn spawn(orchestrator: SyncOrchestrator, period: Duration) -> Self {
        let sync = orchestrator.clone();
        let timer = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // Skip first tick

            loop {
                interval.tick().await;
                if !sync.is_signed_in() {
                    debug!("Skipping scheduled sync: not signed in");
                    continue;
                }
                // Failures are logged and retried by the orchestrator.
                let _ = sync.trigger_sync(SyncReason::Scheduled).await;
            }
        });

        info!(period_secs = period.as_secs(), "Sync scheduler started");
        Self {
            orchestrator,
            timer: Some(timer),
        }
    }

    /// Explicit user-initiated sync.
    pub async fn force_sync(&self) -> crate::sync::engine::SyncOutcome {
        self.orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
    }

    pub fn is_running(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop future fires and cancel pending retries. An in-flight cycle is
    /// left to finish, and explicit syncs keep working.
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.orchestrator.cancel_retry();
        info!("Sync scheduler stopped");
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
