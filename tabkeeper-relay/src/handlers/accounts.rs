//! Account creation and heartbeat handlers.

use super::account_id;
use crate::auth::{generate_token, hash_token};
use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::State;
use axum::http::{Extensions, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// Key under which unauthenticated account creation is rate limited.
const CREATE_ACCOUNT_KEY: &str = "accounts:create";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountResponse {
    pub account_id: String,
    pub token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub last_seen: i64,
}

/// The token is returned once; only its hash is stored.
pub async fn create_account(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreateAccountResponse>), RelayError> {
    let now = Utc::now();
    state.check_rate(CREATE_ACCOUNT_KEY, now.timestamp_millis())?;

    let account_id = Uuid::new_v4().to_string();
    let token = generate_token();
    state
        .storage
        .create_account(&account_id, &hash_token(&token), now.timestamp_millis())?;

    tracing::info!(account_id = %account_id, "Account created");

    Ok((
        StatusCode::CREATED,
        Json(CreateAccountResponse { account_id, token }),
    ))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    extensions: Extensions,
) -> Result<Json<HeartbeatResponse>, RelayError> {
    let account_id = account_id(&extensions)?;
    let last_seen = state
        .storage
        .touch(account_id, Utc::now().timestamp_millis())?;
    Ok(Json(HeartbeatResponse { last_seen }))
}
