//! Gateway request/response messages.

use crate::{AuthFailure, TabkeeperError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from an extension context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Request {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: None,
            token: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Framed request: the caller identity travels next to the request fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

/// Stable failure codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TokenMissing,
    TokenExpired,
    TokenSenderMismatch,
    RateLimited,
    UnknownAction,
    NotSignedIn,
    Unauthorized,
    Validation,
    Integrity,
    Network,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            retry_after_ms: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code),
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: i64) -> Self {
        Self {
            retry_after_ms: Some(retry_after_ms),
            ..Self::error(ErrorCode::RateLimited, "rate limit exceeded")
        }
    }

    pub fn from_error(error: &TabkeeperError) -> Self {
        let code = match error {
            TabkeeperError::Auth(AuthFailure::TokenMissing) => ErrorCode::TokenMissing,
            TabkeeperError::Auth(AuthFailure::TokenExpired) => ErrorCode::TokenExpired,
            TabkeeperError::Auth(AuthFailure::SenderMismatch) => ErrorCode::TokenSenderMismatch,
            TabkeeperError::Auth(AuthFailure::NotSignedIn) => ErrorCode::NotSignedIn,
            TabkeeperError::Auth(AuthFailure::Rejected) => ErrorCode::Unauthorized,
            TabkeeperError::RateLimited { retry_after_ms } => {
                return Self::rate_limited(*retry_after_ms)
            }
            TabkeeperError::Validation(_) => ErrorCode::Validation,
            TabkeeperError::Integrity(_) => ErrorCode::Integrity,
            TabkeeperError::Network(_) => ErrorCode::Network,
            _ => ErrorCode::Internal,
        };
        Self::error(code, error.to_string())
    }
}

/// Framed response echoing the request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub response: Response,
}
