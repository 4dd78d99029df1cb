//! Crypto & token service.
//!
//! Two capabilities behind one module: authenticated symmetric
//! encryption for opaque medical payloads (`payload`) and signed
//! session tokens with embedded expiry (`token`). Both are configured
//! from required secrets; the absence of either is a startup
//! `ConfigError` and the service refuses to serve medical endpoints.

pub mod payload;
pub mod token;

pub use payload::{decrypt, encrypt, SealedPayload};
pub use token::{FixedClock, SystemClock, TokenClaims, TokenClock, TokenError, TokenService};

/// Errors from the payload crypto capability.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Unknown payload algorithm: {0}")]
    AlgorithmMismatch(String),
    #[error("Payload timestamp is inconsistent")]
    TimestampInconsistent,
    #[error("Payload is malformed")]
    Malformed,
}
