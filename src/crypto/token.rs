//! Signed session tokens.
//!
//! A token is an opaque HS256 JWT binding `{sid, exp}`. Expiry is
//! validated against an injectable clock rather than the library's
//! internal `SystemTime` path, so token tests are fully deterministic
//! and the store and token service share one time source.

use std::sync::Arc;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clock abstraction shared with the session store.
pub trait TokenClock: Send + Sync {
    fn now_epoch_secs(&self) -> i64;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TokenClock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl TokenClock for FixedClock {
    fn now_epoch_secs(&self) -> i64 {
        self.0
    }
}

/// Token validation failures, ordered from shape problems to policy
/// problems. The session store maps these onto its own failure set.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is malformed")]
    Malformed,
    #[error("Token signature is invalid")]
    BadSignature,
    #[error("Token has expired")]
    Expired,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sid: String,
    exp: i64,
}

/// Validated claims handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub session_id: Uuid,
    /// Epoch seconds.
    pub expires_at: i64,
}

/// Issues and validates signed session tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock: Arc<dyn TokenClock>,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &str, clock: Arc<dyn TokenClock>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            clock,
        }
    }

    /// Issue a token binding the session id to an absolute expiry.
    pub fn issue(&self, session_id: Uuid, expires_at_epoch: i64) -> Result<String, TokenError> {
        let claims = Claims {
            sid: session_id.to_string(),
            exp: expires_at_epoch,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| TokenError::Malformed)
    }

    /// Validate signature and expiry; expiry is checked against our
    /// own clock, not the library's.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            }
        })?;

        if data.claims.exp <= self.clock.now_epoch_secs() {
            return Err(TokenError::Expired);
        }

        let session_id =
            Uuid::parse_str(&data.claims.sid).map_err(|_| TokenError::Malformed)?;

        Ok(TokenClaims {
            session_id,
            expires_at: data.claims.exp,
        })
    }
}
