//! Signed, time-limited credential tokens. The token payload carries only
//! the identity; password storage and hashing live behind the session
//! store, outside this crate's concern.

use crate::error::{GameError, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

/// HS256 signing/verification keys derived from one shared secret.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issues a token for `username` valid for `ttl`.
    pub fn issue(&self, username: &str, ttl: Duration) -> Result<String> {
        let exp = now_secs() + ttl.as_secs();
        let claims = Claims {
            sub: username.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| GameError::AuthenticationFailed)
    }

    /// Verifies signature and expiry, returning the identity the token was
    /// issued for. Any defect maps to `AuthenticationFailed`.
    pub fn verify(&self, token: &str) -> Result<String> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| GameError::AuthenticationFailed)?;
        Ok(data.claims.sub)
    }

    /// Verifies that `token` was issued for exactly `username`.
    pub fn verify_identity(&self, token: &str, username: &str) -> Result<()> {
        if self.verify(token)? == username {
            Ok(())
        } else {
            Err(GameError::AuthenticationFailed)
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Header};

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let keys = TokenKeys::new("test-secret");
        let token = keys.issue("alice", DEFAULT_TOKEN_TTL).unwrap();
        assert_eq!(keys.verify(&token).unwrap(), "alice");
        assert!(keys.verify_identity(&token, "alice").is_ok());
    }

    #[test]
    fn test_identity_mismatch_fails() {
        let keys = TokenKeys::new("test-secret");
        let token = keys.issue("alice", DEFAULT_TOKEN_TTL).unwrap();
        assert!(matches!(
            keys.verify_identity(&token, "bob"),
            Err(GameError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let keys = TokenKeys::new("test-secret");
        let other = TokenKeys::new("other-secret");
        let token = keys.issue("alice", DEFAULT_TOKEN_TTL).unwrap();
        assert!(matches!(
            other.verify(&token),
            Err(GameError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_expired_token_fails() {
        let keys = TokenKeys::new("test-secret");
        let claims = Claims {
            sub: "alice".into(),
            exp: now_secs() - 120,
        };
        let token = encode(&Header::default(), &claims, &keys.encoding).unwrap();
        assert!(matches!(
            keys.verify(&token),
            Err(GameError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_garbage_token_fails() {
        let keys = TokenKeys::new("test-secret");
        assert!(matches!(
            keys.verify("not-a-token"),
            Err(GameError::AuthenticationFailed)
        ));
    }
}
