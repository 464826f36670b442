//! Single-use, sender-bound session tokens.

use crate::AuthFailure;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bytes of randomness per token.
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
struct Issued {
    sender: String,
    expires_at: i64,
}

/// Token table owned by one gateway instance.
pub struct TokenStore {
    tokens: Mutex<HashMap<String, Issued>>,
    ttl_ms: i64,
}

impl TokenStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Issue a token bound to `sender`, valid until `now_ms + ttl`.
    pub fn mint(&self, sender: &str, now_ms: i64) -> (String, i64) {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let expires_at = now_ms + self.ttl_ms;

        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                token.clone(),
                Issued {
                    sender: sender.to_string(),
                    expires_at,
                },
            );
        (token, expires_at)
    }

    /// Validate and consume `token` for `sender` in one step.
    ///
    /// A token presented by the wrong sender is left in place; an expired
    /// one is removed.
    pub fn consume(&self, sender: &str, token: &str, now_ms: i64) -> Result<(), AuthFailure> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());

        let issued = tokens.get(token).ok_or(AuthFailure::TokenMissing)?;
        if issued.expires_at <= now_ms {
            tokens.remove(token);
            return Err(AuthFailure::TokenExpired);
        }
        if issued.sender != sender {
            return Err(AuthFailure::SenderMismatch);
        }

        tokens.remove(token);
        Ok(())
    }

    /// Purge expired tokens. Returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let before = tokens.len();
        tokens.retain(|_, issued| issued.expires_at > now_ms);
        before - tokens.len()
    }

    pub fn outstanding(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_single_use() {
        let store = TokenStore::new(300_000);
        let (token, expires_at) = store.mint("popup", 1_000);
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert_eq!(expires_at, 301_000);

        assert_eq!(store.consume("popup", &token, 2_000), Ok(()));
        assert_eq!(
            store.consume("popup", &token, 2_001),
            Err(AuthFailure::TokenMissing)
        );
    }

    #[test]
    fn wrong_sender_does_not_consume() {
        let store = TokenStore::new(300_000);
        let (token, _) = store.mint("popup", 0);

        assert_eq!(
            store.consume("content-script", &token, 1),
            Err(AuthFailure::SenderMismatch)
        );
        assert_eq!(store.consume("popup", &token, 2), Ok(()));
    }

    #[test]
    fn expired_token_is_rejected_and_removed() {
        let store = TokenStore::new(100);
        let (token, _) = store.mint("popup", 0);

        assert_eq!(
            store.consume("popup", &token, 100),
            Err(AuthFailure::TokenExpired)
        );
        assert_eq!(store.outstanding(), 0);
    }

    #[test]
    fn sweep_purges_only_expired() {
        let store = TokenStore::new(100);
        store.mint("a", 0);
        store.mint("b", 50);

        assert_eq!(store.sweep(120), 1);
        assert_eq!(store.outstanding(), 1);
    }

    #[test]
    fn tokens_are_unique() {
        let store = TokenStore::new(100);
        let (a, _) = store.mint("a", 0);
        let (b, _) = store.mint("a", 0);
        assert_ne!(a, b);
    }
}
