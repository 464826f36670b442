//! HTTP handlers for the relay API.

pub mod accounts;
pub mod collections;
pub mod snapshot;

use crate::error::RelayError;
use crate::storage::models::AccountId;
use axum::http::Extensions;

/// Account attached by the auth middleware.
fn account_id(extensions: &Extensions) -> Result<&str, RelayError> {
    extensions
        .get::<AccountId>()
        .map(|account| account.0.as_str())
        .ok_or_else(|| RelayError::Auth("No account".to_string()))
}
