//! Per-collection fetch and full-replace push.

use super::account_id;
use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::Extensions;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabkeeper_core::{Collection, Record};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub records: Vec<Value>,
    pub server_timestamp: i64,
}

#[derive(Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub records: Vec<Value>,
}

#[derive(Serialize)]
pub struct PushResponse {
    pub accepted: usize,
}

pub(crate) fn parse_collection(name: &str) -> Result<Collection, RelayError> {
    Collection::parse(name).ok_or_else(|| RelayError::NotFound(format!("Unknown collection: {}", name)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    extensions: Extensions,
) -> Result<Json<FetchResponse>, RelayError> {
    let account_id = account_id(&extensions)?;
    let collection = parse_collection(&collection)?;

    let records = state.storage.load_collection(account_id, collection)?;
    Ok(Json(FetchResponse {
        records,
        server_timestamp: Utc::now().timestamp_millis(),
    }))
}

/// Replace the stored collection with the valid records of the request.
pub async fn push(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    extensions: Extensions,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, RelayError> {
    let account_id = account_id(&extensions)?;
    let collection = parse_collection(&collection)?;

    let records = state.validate(collection, req.records)?;
    let accepted = records.len();
    state
        .storage
        .replace_collections(account_id, &[(collection, records)], Utc::now().timestamp_millis())?;

    tracing::debug!(account_id, %collection, accepted, "Collection replaced");
    Ok(Json(PushResponse { accepted }))
}

/// Keep only records that parse, in wire form.
pub(crate) fn valid_records(collection: Collection, values: Vec<Value>) -> Vec<Value> {
    let (records, rejected) = Record::parse_all(values, collection);
    if !rejected.is_empty() {
        tracing::warn!(%collection, dropped = rejected.len(), "Dropped invalid records");
    }
    records.iter().map(Record::to_value).collect()
}
