//! Relay storage model types.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub account_id: String,
    pub last_seen: i64,
}

/// Authenticated account attached to a request by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId(pub String);
