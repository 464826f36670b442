//! Whole-account snapshot exchange.

use super::account_id;
use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::State;
use axum::http::Extensions;
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tabkeeper_core::{Collection, Record, SyncPayload};

use super::collections::PushResponse;

pub async fn fetch(
    State(state): State<AppState>,
    extensions: Extensions,
) -> Result<Json<SyncPayload>, RelayError> {
    let account_id = account_id(&extensions)?;

    let mut collections = BTreeMap::new();
    for collection in Collection::ALL {
        let values = state.storage.load_collection(account_id, collection)?;
        let (records, _) = Record::parse_all(values, collection);
        collections.insert(collection, records);
    }
    Ok(Json(SyncPayload::from_collections(&collections)))
}

/// Replace every collection of the account in one transaction.
pub async fn push(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(payload): Json<SyncPayload>,
) -> Result<Json<PushResponse>, RelayError> {
    let account_id = account_id(&extensions)?;

    let (collections, rejected) = payload.into_collections();
    if !rejected.is_empty() {
        tracing::warn!(account_id, dropped = rejected.len(), "Dropped invalid snapshot records");
    }

    let mut replacements: Vec<(Collection, Vec<Value>)> = Vec::with_capacity(collections.len());
    for (collection, records) in collections {
        let values = records.iter().map(Record::to_value).collect();
        replacements.push((collection, state.validate(collection, values)?));
    }

    let accepted = replacements.iter().map(|(_, records)| records.len()).sum();
    state
        .storage
        .replace_collections(account_id, &replacements, Utc::now().timestamp_millis())?;

    Ok(Json(PushResponse { accepted }))
}
