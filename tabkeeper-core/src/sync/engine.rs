//! Sync orchestrator: drives the fetch, merge, persist, push cycle.
//!
//! At most one cycle runs at a time. The `Idle -> Fetching` transition is a
//! compare-and-set under the slot lock, taken before the first await; callers
//! arriving while a cycle is in flight share its outcome. Each cycle runs on
//! its own task, so dropping caller futures never aborts it.

use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::remote::{RemoteClient, RemoteError};
use crate::store::CollectionStore;
use crate::sync::backoff::Backoff;
use crate::sync::conflict::ConflictResolver;
use crate::sync::models::{Collection, Record, SyncState};
use crate::{AuthFailure, TabkeeperError};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Merging,
    Persisting,
    Pushing,
    Error,
}

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncReason {
    Scheduled,
    Authenticated,
    UserRequested,
    Retry,
}

/// Snapshot of the orchestrator published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<i64>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_sync_at: None,
            last_error: None,
            consecutive_failures: 0,
            next_retry_at: None,
        }
    }
}

/// A locally stored record skipped because its sealed payload failed
/// authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityFlag {
    pub collection: Collection,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFailure {
    pub collection: Collection,
    pub error: String,
}

/// Result of a completed cycle. Push failures do not fail the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub reason: SyncReason,
    pub started_at: i64,
    pub finished_at: i64,
    /// Records per collection after the merge.
    pub merged: BTreeMap<Collection, usize>,
    pub pushed: Vec<Collection>,
    pub push_failures: Vec<PushFailure>,
    pub integrity_failures: Vec<IntegrityFlag>,
    /// Remote entries dropped by validation.
    pub rejected_remote: usize,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.push_failures.is_empty()
    }
}

/// A cycle that aborted in `phase`. Cloneable so every joined caller gets it.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub phase: SyncPhase,
    pub error: Arc<TabkeeperError>,
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync failed while {:?}: {}", self.phase, self.error)
    }
}

impl std::error::Error for SyncFailure {}

impl From<SyncFailure> for TabkeeperError {
    fn from(failure: SyncFailure) -> Self {
        let shared = match Arc::try_unwrap(failure.error) {
            Ok(error) => return error,
            Err(shared) => shared,
        };
        match &*shared {
            TabkeeperError::Validation(m) => Self::Validation(m.clone()),
            TabkeeperError::Network(m) => Self::Network(m.clone()),
            TabkeeperError::Integrity(m) => Self::Integrity(m.clone()),
            TabkeeperError::Auth(a) => Self::Auth(a.clone()),
            TabkeeperError::RateLimited { retry_after_ms } => Self::RateLimited {
                retry_after_ms: *retry_after_ms,
            },
            TabkeeperError::Concurrency(m) => Self::Concurrency(m.clone()),
            TabkeeperError::ShutDown => Self::ShutDown,
            TabkeeperError::Storage(e) => Self::Storage(e.clone()),
            TabkeeperError::Crypto(e) => Self::Crypto(e.clone()),
            TabkeeperError::Config(m) => Self::Config(m.clone()),
            TabkeeperError::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type SyncOutcome = std::result::Result<SyncReport, SyncFailure>;

type InFlight = Shared<BoxFuture<'static, SyncOutcome>>;

struct Slot {
    phase: SyncPhase,
    in_flight: Option<InFlight>,
}

struct Inner {
    store: Arc<CollectionStore>,
    remote: Arc<dyn RemoteClient>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    backoff: Backoff,
    auth: RwLock<Option<String>>,
    slot: Mutex<Slot>,
    status: watch::Sender<SyncStatus>,
    retry: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Handle to the sync state machine. Clones share one orchestrator.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<CollectionStore>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
        settings: &SyncSettings,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                clock,
                request_timeout: settings.request_timeout(),
                backoff: settings.backoff(),
                auth: RwLock::new(None),
                slot: Mutex::new(Slot {
                    phase: SyncPhase::Idle,
                    in_flight: None,
                }),
                status,
                retry: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start a cycle, or join the one already in flight.
    pub async fn trigger_sync(&self, reason: SyncReason) -> SyncOutcome {
        Inner::trigger(&self.inner, reason).await
    }

    /// Store the account token and start an authenticated cycle.
    pub async fn sign_in(&self, token: String) -> SyncOutcome {
        self.set_auth_token(Some(token));
        self.trigger_sync(SyncReason::Authenticated).await
    }

    /// Forget the account token and any pending retry.
    pub fn sign_out(&self) {
        self.set_auth_token(None);
        self.inner.cancel_retry();
    }

    /// Drop a scheduled retry, if any. Later failures schedule new ones.
    pub fn cancel_retry(&self) {
        self.inner.cancel_retry();
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        let mut auth = self.inner.auth.write().unwrap_or_else(|e| e.into_inner());
        *auth = token;
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner
            .auth
            .read()
            .map(|auth| auth.is_some())
            .unwrap_or(false)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.inner.store
    }

    /// Stop scheduling retries and refuse new cycles. An in-flight cycle
    /// still runs to completion.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.cancel_retry();
        info!("Sync orchestrator shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn trigger(this: &Arc<Self>, reason: SyncReason) -> InFlight {
        let mut slot = lock(&this.slot);

        if let Some(in_flight) = &slot.in_flight {
            debug!(?reason, "Joining in-flight sync cycle");
            return in_flight.clone();
        }

        if this.shut_down.load(Ordering::SeqCst) {
            let failure = SyncFailure {
                phase: slot.phase,
                error: Arc::new(TabkeeperError::ShutDown),
            };
            return futures::future::ready(Err(failure)).boxed().shared();
        }

        debug_assert_eq!(slot.phase, SyncPhase::Idle);
        slot.phase = SyncPhase::Fetching;
        this.publish(|s| s.phase = SyncPhase::Fetching);

        // The slot lock is held until `in_flight` is set, so the task
        // cannot clear the slot before it is filled.
        let task = tokio::spawn(Self::run_cycle(this.clone(), reason));
        let in_flight = async move {
            task.await.unwrap_or_else(|e| {
                Err(SyncFailure {
                    phase: SyncPhase::Error,
                    error: Arc::new(TabkeeperError::Concurrency(format!(
                        "sync task failed: {}",
                        e
                    ))),
                })
            })
        }
        .boxed()
        .shared();

        slot.in_flight = Some(in_flight.clone());
        in_flight
    }

    async fn run_cycle(this: Arc<Self>, reason: SyncReason) -> SyncOutcome {
        let started_at = this.clock.now_ms();
        info!(?reason, "Sync cycle started");

        let outcome = this.cycle(reason, started_at).await;

        let retry = match &outcome {
            Ok(report) if report.is_complete() => {
                info!(
                    collections = report.pushed.len(),
                    integrity_failures = report.integrity_failures.len(),
                    "Sync cycle complete"
                );
                this.cancel_retry();
                this.publish(|s| {
                    s.last_sync_at = Some(report.finished_at);
                    s.last_error = None;
                    s.consecutive_failures = 0;
                    s.next_retry_at = None;
                });
                false
            }
            Ok(report) => {
                let failed: Vec<&str> = report
                    .push_failures
                    .iter()
                    .map(|f| f.collection.as_str())
                    .collect();
                warn!(?failed, "Sync cycle finished with push failures");
                this.publish(|s| {
                    s.last_sync_at = Some(report.finished_at);
                    s.last_error = Some(format!("push failed for {}", failed.join(", ")));
                    s.consecutive_failures += 1;
                });
                true
            }
            Err(failure) => {
                error!(phase = ?failure.phase, error = %failure.error, "Sync cycle failed");
                this.set_phase(SyncPhase::Error);
                this.publish(|s| {
                    s.last_error = Some(failure.error.to_string());
                    s.consecutive_failures += 1;
                    s.next_retry_at = None;
                });
                failure.error.is_retryable()
            }
        };

        {
            let mut slot = lock(&this.slot);
            slot.phase = SyncPhase::Idle;
            slot.in_flight = None;
        }
        this.publish(|s| s.phase = SyncPhase::Idle);

        // After the slot is free, so a zero-delay retry starts a new cycle.
        if retry {
            this.schedule_retry();
        }
        outcome
    }

    async fn cycle(&self, reason: SyncReason, started_at: i64) -> SyncOutcome {
        let token = self
            .auth
            .read()
            .ok()
            .and_then(|auth| auth.clone())
            .ok_or_else(|| fail(SyncPhase::Fetching, AuthFailure::NotSignedIn.into()))?;

        // Fetching
        let local_reads = self
            .store
            .read_all()
            .await
            .map_err(|e| fail(SyncPhase::Fetching, e))?;

        let mut integrity_failures = Vec::new();
        let mut local = BTreeMap::new();
        for (collection, read) in local_reads {
            integrity_failures.extend(read.integrity_failures.into_iter().map(|id| IntegrityFlag {
                collection,
                id,
            }));
            local.insert(collection, read.records);
        }

        let mut remote = BTreeMap::new();
        let mut rejected_remote = 0;
        for collection in Collection::ALL {
            let response = self
                .bounded(self.remote.fetch(collection, &token))
                .await
                .map_err(|e| fail(SyncPhase::Fetching, e.into()))?;

            let (records, rejected) = Record::parse_all(response.records, collection);
            for e in &rejected {
                warn!(%collection, error = %e, "Dropping invalid remote record");
            }
            rejected_remote += rejected.len();
            remote.insert(collection, records);
        }

        // Merging
        self.set_phase(SyncPhase::Merging);
        let merged = ConflictResolver::merge_all(&local, &remote);

        // Persisting
        self.set_phase(SyncPhase::Persisting);
        let persisted = self
            .store
            .persist_merged(&merged)
            .await
            .map_err(|e| fail(SyncPhase::Persisting, e))?;

        // Pushing
        self.set_phase(SyncPhase::Pushing);
        let mut pushed = Vec::new();
        let mut push_failures = Vec::new();
        for (collection, records) in &persisted {
            match self.bounded(self.remote.push(*collection, records, &token)).await {
                Ok(response) => {
                    debug!(%collection, accepted = response.accepted, "Pushed collection");
                    let state = SyncState {
                        last_sync_time: Some(self.clock.now_ms()),
                    };
                    if let Err(e) = self.store.set_sync_state(*collection, state).await {
                        warn!(%collection, error = %e, "Failed to record sync time");
                    }
                    pushed.push(*collection);
                }
                Err(e) => {
                    warn!(%collection, error = %e, "Push failed; merged data stays local");
                    push_failures.push(PushFailure {
                        collection: *collection,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !pushed.is_empty() {
            if let Err(e) = self.bounded(self.remote.heartbeat(&token)).await {
                debug!(error = %e, "Heartbeat failed");
            }
        }

        Ok(SyncReport {
            reason,
            started_at,
            finished_at: self.clock.now_ms(),
            merged: persisted.iter().map(|(c, r)| (*c, r.len())).collect(),
            pushed,
            push_failures,
            integrity_failures,
            rejected_remote,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.request_timeout.as_secs())),
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        lock(&self.slot).phase = phase;
        self.publish(|s| s.phase = phase);
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(update);
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let attempt = self.status.borrow().consecutive_failures.saturating_sub(1);
        let delay = self.backoff.delay(attempt);
        let retry_at = self.clock.now_ms() + delay.as_millis() as i64;
        self.publish(|s| s.next_retry_at = Some(retry_at));
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling sync retry");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = Self::trigger(&this, SyncReason::Retry).await;
        });

        if let Some(previous) = lock(&self.retry).replace(handle) {
            previous.abort();
        }
    }

    fn cancel_retry(&self) {
        if let Some(pending) = lock(&self.retry).take() {
            pending.abort();
        }
        self.publish(|s| s.next_retry_at = None);
    }
}

fn fail(phase: SyncPhase, error: TabkeeperError) -> SyncFailure {
    SyncFailure {
        phase,
        error: Arc::new(error),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::{CryptoBox, SealingKey};
    use crate::remote::{FetchResponse, HeartbeatResponse, PushResponse};
    use crate::store::{LocalStore, MemoryStore, StoreError};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    /// Scripted in-memory sync endpoint.
    #[derive(Default)]
    pub(crate) struct FakeRemote {
        pub data: Mutex<BTreeMap<Collection, Vec<Value>>>,
        pub fetches: AtomicUsize,
        pub pushes: AtomicUsize,
        pub heartbeats: AtomicUsize,
        pub delay: Duration,
        pub failing_fetches: AtomicUsize,
        pub failing_pushes: Mutex<HashSet<Collection>>,
    }

    impl FakeRemote {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        pub fn seed(&self, collection: Collection, records: Vec<Value>) {
            lock(&self.data).insert(collection, records);
        }

        pub fn records(&self, collection: Collection) -> Vec<Value> {
            lock(&self.data).get(&collection).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn fetch(&self, collection: Collection, _auth: &str) -> Result<FetchResponse, RemoteError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self
                .failing_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RemoteError::Network("connection refused".to_string()));
            }
            Ok(FetchResponse {
                records: self.records(collection),
                server_timestamp: 0,
            })
        }

        async fn push(
            &self,
            collection: Collection,
            records: &[Record],
            _auth: &str,
        ) -> Result<PushResponse, RemoteError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if lock(&self.failing_pushes).contains(&collection) {
                return Err(RemoteError::Network("503 Service Unavailable".to_string()));
            }
            let values: Vec<Value> = records.iter().map(Record::to_value).collect();
            let accepted = values.len();
            lock(&self.data).insert(collection, values);
            Ok(PushResponse { accepted })
        }

        async fn heartbeat(&self, _auth: &str) -> Result<HeartbeatResponse, RemoteError> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(HeartbeatResponse { last_seen: 0 })
        }
    }

    /// Store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl LocalStore for FlakyStore {
        async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StoreError> {
            self.inner.get(keys).await
        }

        async fn set(&self, entries: HashMap<String, Value>) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.set(entries).await
        }

        async fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
            self.inner.remove(keys).await
        }
    }

    struct Harness {
        backend: Arc<FlakyStore>,
        remote: Arc<FakeRemote>,
        store: Arc<CollectionStore>,
        orchestrator: SyncOrchestrator,
    }

    fn harness(remote: FakeRemote, settings: SyncSettings) -> Harness {
        let backend = Arc::new(FlakyStore::default());
        let clock = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(CollectionStore::new(
            backend.clone(),
            CryptoBox::new(SealingKey::generate()),
            settings.sealed_collections.clone(),
            clock.clone(),
        ));
        let remote = Arc::new(remote);
        let orchestrator = SyncOrchestrator::new(store.clone(), remote.clone(), clock, &settings);
        Harness {
            backend,
            remote,
            store,
            orchestrator,
        }
    }

    fn slow_retry_settings() -> SyncSettings {
        SyncSettings {
            backoff_base_secs: 3600,
            backoff_cap_secs: 3600,
            ..SyncSettings::default()
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[tokio::test]
    async fn rapid_triggers_share_one_cycle() {
        let h = harness(
            FakeRemote::with_delay(Duration::from_millis(30)),
            slow_retry_settings(),
        );
        h.orchestrator.set_auth_token(Some("token".to_string()));

        let (a, b) = tokio::join!(
            h.orchestrator.trigger_sync(SyncReason::UserRequested),
            h.orchestrator.trigger_sync(SyncReason::Scheduled),
        );

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(a.reason, SyncReason::UserRequested);
        assert_eq!(h.remote.fetches.load(Ordering::SeqCst), 5);
        assert_eq!(h.remote.pushes.load(Ordering::SeqCst), 5);
        assert_eq!(h.remote.heartbeats.load(Ordering::SeqCst), 1);
        assert_eq!(h.orchestrator.status().phase, SyncPhase::Idle);

        // The slot is free again.
        h.orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
            .unwrap();
        assert_eq!(h.remote.fetches.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_abort_cycle() {
        let h = harness(
            FakeRemote::with_delay(Duration::from_millis(20)),
            slow_retry_settings(),
        );
        h.orchestrator.set_auth_token(Some("token".to_string()));
        let mut status = h.orchestrator.subscribe();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            h.orchestrator.trigger_sync(SyncReason::UserRequested),
        )
        .await;
        assert!(abandoned.is_err());

        status
            .wait_for(|s| s.last_sync_at.is_some() && s.phase == SyncPhase::Idle)
            .await
            .unwrap();
        assert_eq!(h.remote.pushes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn remote_edit_wins_and_is_pushed_back() {
        let h = harness(FakeRemote::default(), slow_retry_settings());
        h.orchestrator.set_auth_token(Some("token".to_string()));

        // Local copy written at clock 10_000.
        h.store
            .upsert(Collection::Tasks, "1", payload(json!({"title": "Buy milk"})))
            .await
            .unwrap();
        h.remote.seed(
            Collection::Tasks,
            vec![json!({"id": "1", "title": "Buy milk v2", "lastModified": 20_000})],
        );

        let report = h
            .orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.merged[&Collection::Tasks], 1);

        let local = h.store.list_active(Collection::Tasks).await.unwrap();
        assert_eq!(local[0].payload["title"], json!("Buy milk v2"));
        assert_eq!(h.remote.records(Collection::Tasks)[0]["title"], json!("Buy milk v2"));
        assert_eq!(
            h.store.sync_state(Collection::Tasks).await.unwrap().last_sync_time,
            Some(10_000)
        );
    }

    #[tokio::test]
    async fn missing_auth_is_not_retried() {
        let h = harness(FakeRemote::default(), slow_retry_settings());

        let failure = h
            .orchestrator
            .trigger_sync(SyncReason::Scheduled)
            .await
            .unwrap_err();
        assert_eq!(failure.phase, SyncPhase::Fetching);
        assert!(matches!(
            *failure.error,
            TabkeeperError::Auth(AuthFailure::NotSignedIn)
        ));
        assert_eq!(h.remote.fetches.load(Ordering::SeqCst), 0);

        let status = h.orchestrator.status();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        assert!(status.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn fetch_failure_schedules_retry() {
        let remote = FakeRemote::default();
        remote.failing_fetches.store(1, Ordering::SeqCst);
        let h = harness(remote, slow_retry_settings());
        h.orchestrator.set_auth_token(Some("token".to_string()));

        let failure = h
            .orchestrator
            .trigger_sync(SyncReason::Scheduled)
            .await
            .unwrap_err();
        assert_eq!(failure.phase, SyncPhase::Fetching);
        assert!(matches!(*failure.error, TabkeeperError::Network(_)));
        assert_eq!(h.remote.pushes.load(Ordering::SeqCst), 0);

        let status = h.orchestrator.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.next_retry_at.is_some());

        h.orchestrator.shutdown();
        assert!(h.orchestrator.status().next_retry_at.is_none());
    }

    #[tokio::test]
    async fn retry_reruns_the_cycle() {
        let remote = FakeRemote::default();
        remote.failing_fetches.store(1, Ordering::SeqCst);
        let settings = SyncSettings {
            backoff_base_secs: 0,
            backoff_cap_secs: 0,
            ..SyncSettings::default()
        };
        let h = harness(remote, settings);
        h.orchestrator.set_auth_token(Some("token".to_string()));
        let mut status = h.orchestrator.subscribe();

        assert!(h
            .orchestrator
            .trigger_sync(SyncReason::Scheduled)
            .await
            .is_err());

        status
            .wait_for(|s| s.last_sync_at.is_some() && s.consecutive_failures == 0)
            .await
            .unwrap();
        assert_eq!(h.remote.fetches.load(Ordering::SeqCst), 6);
        assert_eq!(h.remote.pushes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn push_failure_keeps_merged_data_local() {
        let h = harness(FakeRemote::default(), slow_retry_settings());
        h.orchestrator.set_auth_token(Some("token".to_string()));
        lock(&h.remote.failing_pushes).insert(Collection::Tasks);

        h.store
            .upsert(Collection::Tasks, "1", payload(json!({"title": "Walk dog"})))
            .await
            .unwrap();

        let report = h
            .orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.push_failures[0].collection, Collection::Tasks);
        assert_eq!(report.pushed.len(), 4);

        // Durable locally, not marked synced.
        assert_eq!(h.store.list_active(Collection::Tasks).await.unwrap().len(), 1);
        assert_eq!(
            h.store.sync_state(Collection::Tasks).await.unwrap().last_sync_time,
            None
        );
        assert!(h
            .store
            .sync_state(Collection::Settings)
            .await
            .unwrap()
            .last_sync_time
            .is_some());

        let status = h.orchestrator.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.next_retry_at.is_some());
        h.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn persist_failure_pushes_nothing() {
        let h = harness(FakeRemote::default(), slow_retry_settings());
        h.orchestrator.set_auth_token(Some("token".to_string()));
        h.store
            .upsert(Collection::Tasks, "1", payload(json!({"title": "Walk dog"})))
            .await
            .unwrap();
        h.remote.seed(
            Collection::Tasks,
            vec![json!({"id": "2", "title": "Remote", "lastModified": 1})],
        );
        h.backend.fail_writes.store(true, Ordering::SeqCst);

        let failure = h
            .orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
            .unwrap_err();
        assert_eq!(failure.phase, SyncPhase::Persisting);
        assert!(matches!(*failure.error, TabkeeperError::Storage(_)));
        assert_eq!(h.remote.pushes.load(Ordering::SeqCst), 0);

        // Last committed state is untouched.
        let local = h.store.read(Collection::Tasks).await.unwrap().records;
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, "1");
        h.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn integrity_failure_skips_record_and_continues() {
        let settings = SyncSettings {
            sealed_collections: vec![Collection::ActivityLogs],
            ..slow_retry_settings()
        };
        let h = harness(FakeRemote::default(), settings);
        h.orchestrator.set_auth_token(Some("token".to_string()));

        h.store
            .upsert(
                Collection::ActivityLogs,
                "1:a.com",
                payload(json!({"domain": "a.com", "seconds": 5})),
            )
            .await
            .unwrap();
        h.store
            .upsert(
                Collection::ActivityLogs,
                "2:b.com",
                payload(json!({"domain": "b.com", "seconds": 7})),
            )
            .await
            .unwrap();

        // Corrupt the authentication tag of one entry.
        let key = "collections/activityLogs";
        let mut raw = h.backend.inner.snapshot()[key].clone();
        let entry = raw
            .as_array_mut()
            .unwrap()
            .iter_mut()
            .find(|v| v["id"] == json!("2:b.com"))
            .unwrap();
        entry["sealed"]["tag"] = json!("AAAAAAAAAAAAAAAAAAAAAA==");
        h.backend
            .set(HashMap::from([(key.to_string(), raw)]))
            .await
            .unwrap();

        let report = h
            .orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
            .unwrap();
        assert_eq!(
            report.integrity_failures,
            vec![IntegrityFlag {
                collection: Collection::ActivityLogs,
                id: "2:b.com".to_string(),
            }]
        );
        assert!(report.is_complete());
        let pushed = h.remote.records(Collection::ActivityLogs);
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["id"], json!("1:a.com"));

        // The unreadable entry is still stored for a later recovery.
        let read = h.store.read(Collection::ActivityLogs).await.unwrap();
        assert_eq!(read.integrity_failures, vec!["2:b.com".to_string()]);
    }

    #[tokio::test]
    async fn shut_down_orchestrator_refuses_new_cycles() {
        let h = harness(FakeRemote::default(), slow_retry_settings());
        h.orchestrator.set_auth_token(Some("token".to_string()));
        h.orchestrator.shutdown();

        let failure = h
            .orchestrator
            .trigger_sync(SyncReason::UserRequested)
            .await
            .unwrap_err();
        assert!(matches!(*failure.error, TabkeeperError::ShutDown));
        assert_eq!(h.remote.fetches.load(Ordering::SeqCst), 0);
    }
}
