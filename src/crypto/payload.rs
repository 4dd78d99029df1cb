//! Symmetric authenticated encryption for opaque medical blobs.
//!
//! Wire shape is `{ciphertext, alg, ts}` where `ciphertext` is the
//! base64 of `nonce || ct+tag` and `alg` carries a version prefix so
//! keys can rotate without re-parsing old payloads.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::CryptoError;

const NONCE_LENGTH: usize = 12;
/// AES-GCM appends a 16-byte auth tag.
const TAG_LENGTH: usize = 16;
/// Current algorithm identifier. Decrypt rejects anything else.
pub const ALG: &str = "aes256gcm.v1";
/// Accepted forward clock skew on `ts`, in seconds.
const MAX_TS_SKEW_SECS: i64 = 60;

/// Encrypted payload container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPayload {
    /// base64(nonce || ciphertext+tag)
    pub ciphertext: String,
    pub alg: String,
    /// Epoch seconds at sealing time.
    pub ts: i64,
}

/// Encrypt a plaintext under the service key with a fresh random nonce.
pub fn encrypt(key_bytes: &[u8; 32], plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut buf = Vec::with_capacity(NONCE_LENGTH + ct.len());
    buf.extend_from_slice(&nonce_bytes);
    buf.extend_from_slice(&ct);

    Ok(SealedPayload {
        ciphertext: base64::engine::general_purpose::STANDARD.encode(buf),
        alg: ALG.to_string(),
        ts: chrono::Utc::now().timestamp(),
    })
}

/// Decrypt a sealed payload, rejecting anything whose MAC, algorithm,
/// or timestamp is inconsistent.
pub fn decrypt(key_bytes: &[u8; 32], sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
    if sealed.alg != ALG {
        return Err(CryptoError::AlgorithmMismatch(sealed.alg.clone()));
    }
    if sealed.ts <= 0 || sealed.ts > chrono::Utc::now().timestamp() + MAX_TS_SKEW_SECS {
        return Err(CryptoError::TimestampInconsistent);
    }

    let buf = base64::engine::general_purpose::STANDARD
        .decode(&sealed.ciphertext)
        .map_err(|_| CryptoError::Malformed)?;
    if buf.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(CryptoError::Malformed);
    }

    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&buf[..NONCE_LENGTH]);

    cipher
        .decrypt(nonce, &buf[NONCE_LENGTH..])
        .map_err(|_| CryptoError::DecryptionFailed)
}
