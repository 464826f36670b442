//! Axum router setup.

use crate::auth::auth_middleware;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::handlers::{accounts, collections, snapshot};
use crate::storage::RelayStorage;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tabkeeper_core::gateway::FixedWindowLimiter;
use tabkeeper_core::Collection;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub limiter: FixedWindowLimiter,
    pub max_records_per_collection: usize,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: &RelayConfig) -> Self {
        Self {
            storage,
            limiter: FixedWindowLimiter::new(
                config.rate_limit_requests,
                (config.rate_limit_window_secs * 1000) as i64,
            ),
            max_records_per_collection: config.max_records_per_collection,
        }
    }

    pub fn check_rate(&self, key: &str, now_ms: i64) -> Result<(), RelayError> {
        self.limiter.check(key, now_ms).map(|_| ()).map_err(|limited| {
            tracing::warn!(key, retry_after_ms = limited.retry_after_ms, "Rate limited");
            RelayError::RateLimited {
                retry_after_secs: (limited.retry_after_ms as u64).div_ceil(1000),
            }
        })
    }

    /// Drop invalid records and enforce the per-collection cap.
    pub fn validate(&self, collection: Collection, values: Vec<Value>) -> Result<Vec<Value>, RelayError> {
        let records = collections::valid_records(collection, values);
        if records.len() > self.max_records_per_collection {
            return Err(RelayError::BadRequest(format!(
                "{} holds {} records, limit is {}",
                collection,
                records.len(),
                self.max_records_per_collection
            )));
        }
        Ok(records)
    }
}

pub fn build_router(state: AppState, config: &RelayConfig) -> Router {
    // Authenticated routes
    let authenticated = Router::new()
        .route(
            "/api/v1/collections/{collection}",
            get(collections::fetch).put(collections::push),
        )
        .route("/api/v1/snapshot", get(snapshot::fetch).put(snapshot::push))
        .route("/api/v1/heartbeat", post(accounts::heartbeat))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Unauthenticated routes
    let public = Router::new()
        .route("/api/v1/accounts", post(accounts::create_account))
        .route("/health", get(health));

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
