//! Remote sync endpoint abstraction.

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpRemoteClient;

use crate::sync::models::{Collection, Record};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failures talking to the sync endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection failure or non-2xx status.
    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// 401/403 from the endpoint.
    #[error("unauthorized")]
    Unauthorized,

    /// Response body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Body of `GET /api/v1/collections/{collection}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    #[serde(default)]
    pub records: Vec<Value>,
    pub server_timestamp: i64,
}

/// Body of `PUT /api/v1/collections/{collection}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub last_seen: i64,
}

/// Client for the remote sync endpoint. Records travel as plain JSON; the
/// local sealing key never leaves the device.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch every record of a collection.
    async fn fetch(&self, collection: Collection, auth: &str) -> Result<FetchResponse, RemoteError>;

    /// Replace the remote copy of a collection.
    async fn push(
        &self,
        collection: Collection,
        records: &[Record],
        auth: &str,
    ) -> Result<PushResponse, RemoteError>;

    async fn heartbeat(&self, auth: &str) -> Result<HeartbeatResponse, RemoteError>;
}
