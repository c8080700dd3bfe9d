//! HMAC-signed session tokens carried in the bearer cookie.
//!
//! Format: `base64url(claims_json) . base64url(hmac_sha256)`. The signing
//! key is generated once at process start; restarting the daemon logs
//! everyone out, which is acceptable for a single-writer service.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::identity::{AuthUser, Permissions};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    perms: Permissions,
    groups: Vec<String>,
    exp: i64,
}

/// Signs and verifies session tokens with a process-lifetime key.
pub struct SessionSigner {
    key: [u8; 64],
    ttl: Duration,
}

impl SessionSigner {
    /// Create a signer with a fresh random key and the given session TTL.
    pub fn new(ttl: Duration) -> Self {
        let mut key = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key, ttl }
    }

    /// Issue a signed token for an authenticated user.
    pub fn sign(&self, user: &AuthUser) -> String {
        let claims = SessionClaims {
            sub: user.username.clone(),
            perms: user.permissions,
            groups: user.groups.clone(),
            exp: (Utc::now() + self.ttl).timestamp(),
        };

        let payload = serde_json::to_vec(&claims).expect("session claims serialize");
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let tag = self.mac(encoded.as_bytes());
        format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(tag))
    }

    /// Verify a token and return the user it names, if valid and unexpired.
    pub fn verify(&self, token: &str) -> Option<AuthUser> {
        let (payload, tag) = token.split_once('.')?;
        let presented = URL_SAFE_NO_PAD.decode(tag).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        mac.verify_slice(&presented).ok()?;

        let claims: SessionClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
        if claims.exp < Utc::now().timestamp() {
            return None;
        }

        Some(AuthUser {
            username: claims.sub,
            permissions: claims.perms,
            groups: claims.groups,
        })
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthUser {
        AuthUser {
            username: "ops".to_string(),
            permissions: Permissions::Administrator,
            groups: vec!["admins".to_string()],
        }
    }

    #[test]
    fn sign_verify_round_trips() {
        let signer = SessionSigner::new(Duration::hours(8));
        let token = signer.sign(&user());
        let verified = signer.verify(&token).unwrap();
        assert_eq!(verified, user());
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let signer = SessionSigner::new(Duration::hours(8));
        let token = signer.sign(&user());

        let mut tampered = token.clone();
        tampered.replace_range(0..1, if &token[0..1] == "A" { "B" } else { "A" });
        assert!(signer.verify(&tampered).is_none());
        assert!(signer.verify("garbage").is_none());
        assert!(signer.verify("").is_none());
    }

    #[test]
    fn tokens_from_another_key_are_rejected() {
        let a = SessionSigner::new(Duration::hours(8));
        let b = SessionSigner::new(Duration::hours(8));
        let token = a.sign(&user());
        assert!(b.verify(&token).is_none());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = SessionSigner::new(Duration::seconds(-1));
        let token = signer.sign(&user());
        assert!(signer.verify(&token).is_none());
    }
}
