//! Bearer-token auth middleware for the relay server.

use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::AccountId;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a fresh account token (32 random bytes, hex encoded).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Tokens are stored only as their SHA-256 digest.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Resolve the bearer token to an account, apply the per-account rate
/// limit, and attach the [`AccountId`] to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, RelayError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("Missing Authorization header".to_string()))?
        .strip_prefix("Bearer ")
        .ok_or_else(|| RelayError::Auth("Invalid auth scheme".to_string()))?
        .trim()
        .to_string();

    if token.is_empty() {
        return Err(RelayError::Auth("Empty bearer token".to_string()));
    }

    let account = state
        .storage
        .account_by_token_hash(&hash_token(&token))?
        .ok_or_else(|| RelayError::Auth("Unknown token".to_string()))?;

    state.check_rate(&account.account_id, Utc::now().timestamp_millis())?;
    tracing::debug!(account_id = %account.account_id, last_seen = account.last_seen, "Authenticated");

    request
        .extensions_mut()
        .insert(AccountId(account.account_id));

    Ok(next.run(request).await)
}
