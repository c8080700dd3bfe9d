//! Short-lived access tokens binding a bearer to one competition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::RwLock;
use tracing::debug;

struct TokenEntry {
    competition_id: String,
    expires_at: Instant,
}

/// In-memory token store. Safe for concurrent use; expired tokens are
/// removed lazily on validation.
#[derive(Default)]
pub struct AccessTokenStore {
    tokens: RwLock<HashMap<String, TokenEntry>>,
}

impl AccessTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token scoped to `competition_id` for `ttl`.
    ///
    /// Tokens carry 256 bits of OS entropy, hex-encoded.
    pub async fn issue(&self, competition_id: &str, ttl: Duration) -> String {
        let mut buf = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        let token: String = buf.iter().map(|b| format!("{b:02x}")).collect();

        let mut tokens = self.tokens.write().await;
        tokens.insert(
            token.clone(),
            TokenEntry {
                competition_id: competition_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(%competition_id, ttl_secs = ttl.as_secs(), "access token issued");

        token
    }

    /// Whether `token` authorizes fetches for `competition_id`.
    pub async fn validate(&self, competition_id: &str, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }

        let expired = {
            let tokens = self.tokens.read().await;
            match tokens.get(token) {
                None => return false,
                Some(entry) if entry.expires_at <= Instant::now() => true,
                Some(entry) => return entry.competition_id == competition_id,
            }
        };

        if expired {
            self.revoke(token).await;
        }
        false
    }

    /// Drop a token immediately.
    pub async fn revoke(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        let mut tokens = self.tokens.write().await;
        tokens.remove(token);
    }

    /// Number of live entries (expired-but-unvalidated included).
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_scopes_to_one_competition() {
        let store = AccessTokenStore::new();
        let token = store.issue("comp-a", Duration::from_secs(60)).await;

        assert!(store.validate("comp-a", &token).await);
        assert!(!store.validate("comp-b", &token).await);
    }

    #[tokio::test]
    async fn tokens_are_unique_and_long() {
        let store = AccessTokenStore::new();
        let a = store.issue("comp", Duration::from_secs(60)).await;
        let b = store.issue("comp", Duration::from_secs(60)).await;
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn expired_tokens_fail_and_are_removed() {
        let store = AccessTokenStore::new();
        let token = store.issue("comp-a", Duration::from_millis(0)).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!store.validate("comp-a", &token).await);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn revoked_tokens_fail() {
        let store = AccessTokenStore::new();
        let token = store.issue("comp-a", Duration::from_secs(60)).await;
        store.revoke(&token).await;
        assert!(!store.validate("comp-a", &token).await);
    }

    #[tokio::test]
    async fn empty_token_never_validates() {
        let store = AccessTokenStore::new();
        assert!(!store.validate("comp-a", "").await);
    }
}
