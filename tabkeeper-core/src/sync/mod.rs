//! State synchronization for Tabkeeper
//!
//! - Last-write-wins merge of versioned collections with tombstones
//! - Single-flight fetch, merge, persist, push cycle
//! - Periodic scheduling with jittered exponential retry

pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod models;
pub mod scheduler;

pub use backoff::Backoff;
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{
    IntegrityFlag, PushFailure, SyncFailure, SyncOrchestrator, SyncOutcome, SyncPhase, SyncReason,
    SyncReport, SyncStatus,
};
pub use models::{Collection, Record, SyncPayload, SyncState};
pub use scheduler::SyncScheduler;
