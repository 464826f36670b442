//! Authenticated encryption for payloads stored at rest.
//!
//! This module provides:
//! - AES-256-GCM sealing with a fresh nonce per call ([`CryptoBox`])
//! - The on-disk blob format ([`EncryptedBlob`])
//! - First-run key generation and persistence ([`keystore`])

pub mod cipher;
pub mod keystore;

pub use cipher::{CryptoBox, EncryptedBlob, SealingKey};
pub use keystore::{load_or_create_key, SEALING_KEY_SLOT};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Tag verification failed or the blob is structurally invalid.
    /// Never accompanied by partial plaintext.
    #[error("Integrity check failed - data may have been tampered with")]
    Integrity,

    #[error("Sealing key is corrupted: {0}")]
    KeyCorrupted(String),

    #[error("Sealing key storage failed: {0}")]
    KeyStorage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
