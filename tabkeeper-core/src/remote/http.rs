//! HTTP client for the Tabkeeper relay.

use crate::remote::{
    FetchResponse, HeartbeatResponse, PushRequest, PushResponse, RemoteClient, RemoteError,
};
use crate::sync::models::{Collection, Record};
use crate::{Result, TabkeeperError};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Response of `POST /api/v1/accounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredentials {
    pub account_id: String,
    pub token: String,
}

pub struct HttpRemoteClient {
    client: reqwest::Client,
    relay_url: String,
    timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(relay_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TabkeeperError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            relay_url: relay_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Create an account on the relay. Unauthenticated.
    pub async fn create_account(&self) -> std::result::Result<AccountCredentials, RemoteError> {
        let url = format!("{}/api/v1/accounts", self.relay_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::decode(resp).await
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        auth: &str,
        body: Option<&B>,
    ) -> std::result::Result<reqwest::Response, RemoteError> {
        let url = format!("{}{}", self.relay_url, path);
        debug!(%method, %url, "Relay request");

        let mut request = self.client.request(method, &url).bearer_auth(auth);
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| self.map_send_error(e))
    }

    fn map_send_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout.as_secs())
        } else {
            RemoteError::Network(e.to_string())
        }
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> std::result::Result<T, RemoteError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(RemoteError::Network(format!("Relay error {}: {}", status, body)));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn fetch(
        &self,
        collection: Collection,
        auth: &str,
    ) -> std::result::Result<FetchResponse, RemoteError> {
        let path = format!("/api/v1/collections/{}", collection);
        let resp = self.send::<()>(Method::GET, &path, auth, None).await?;
        Self::decode(resp).await
    }

    async fn push(
        &self,
        collection: Collection,
        records: &[Record],
        auth: &str,
    ) -> std::result::Result<PushResponse, RemoteError> {
        let path = format!("/api/v1/collections/{}", collection);
        let body = PushRequest {
            records: records.iter().map(Record::to_value).collect(),
        };
        let resp = self.send(Method::PUT, &path, auth, Some(&body)).await?;
        Self::decode(resp).await
    }

    async fn heartbeat(&self, auth: &str) -> std::result::Result<HeartbeatResponse, RemoteError> {
        let resp = self
            .send::<()>(Method::POST, "/api/v1/heartbeat", auth, None)
            .await?;
        Self::decode(resp).await
    }
}
