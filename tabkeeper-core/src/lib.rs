//! Tabkeeper Core Library
//!
//! State synchronization and secure inter-context messaging for the
//! Tabkeeper browser add-ons: last-write-wins merge of versioned
//! collections, sealing of sensitive payloads at rest, a scheduled
//! single-flight sync cycle, and a token-authenticated, rate-limited
//! message gateway.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod gateway;
pub mod platform;
pub mod remote;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TabkeeperConfig;
pub use crypto::{CryptoBox, CryptoError, EncryptedBlob, SealingKey};
pub use gateway::{Access, MessageGateway, Request, Response};
pub use remote::{RemoteClient, RemoteError};
pub use store::{AccountStore, CollectionStore, LocalStore, MemoryStore, Namespaced, SqliteStore, StoreError};
pub use sync::{
    Collection, ConflictResolver, Record, SyncFailure, SyncOrchestrator, SyncOutcome, SyncPayload,
    SyncPhase, SyncReason, SyncReport, SyncScheduler, SyncState, SyncStatus,
};

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, TabkeeperError>;

/// Why an authenticated operation was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("token missing")]
    TokenMissing,

    #[error("token expired")]
    TokenExpired,

    #[error("token bound to a different sender")]
    SenderMismatch,

    #[error("not signed in to the sync account")]
    NotSignedIn,

    #[error("credentials rejected by the sync endpoint")]
    Rejected,
}

/// General error type for core operations
#[derive(Error, Debug)]
pub enum TabkeeperError {
    /// Malformed shape; rejected and never persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unreachable endpoint, timeout or non-2xx response.
    #[error("Network error: {0}")]
    Network(String),

    /// Decryption or tamper check failed.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthFailure),

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: i64 },

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// The sync orchestrator was shut down and takes no new cycles.
    #[error("Sync orchestrator is shut down")]
    ShutDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for TabkeeperError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Integrity => Self::Integrity(e.to_string()),
            other => Self::Crypto(other),
        }
    }
}

impl From<RemoteError> for TabkeeperError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Network(msg) => Self::Network(msg),
            RemoteError::Timeout(secs) => Self::Network(format!("timed out after {}s", secs)),
            RemoteError::Unauthorized => Self::Auth(AuthFailure::Rejected),
            RemoteError::Protocol(msg) => Self::Validation(format!("remote response: {}", msg)),
        }
    }
}

impl TabkeeperError {
    /// Whether the sync scheduler should retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Auth(_) | Self::Config(_) | Self::Crypto(_) | Self::ShutDown
        )
    }
}
