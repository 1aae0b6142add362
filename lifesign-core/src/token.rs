//! Opaque bearer credentials minted on a passed verification.
//!
//! The credential itself is 256 bits of random material; only its SHA-256
//! digest is persisted, so a leaked store cannot be replayed as tokens.

use crate::store::{ChallengeStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token not found or has been revoked")]
    NotFound,
    #[error("Token has been revoked")]
    Revoked,
    #[error("Token has expired")]
    Expired,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Credential handed back to the claimant. Never persisted.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Server-side record of a minted credential, keyed by token hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_hash: String,
    pub subject: String,
    pub user_label: Option<String>,
    pub liveness_score: f32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// SHA-256 hex digest of a token, the storage and lookup key.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Mint a fresh credential for `subject`, valid for `ttl_seconds`.
pub fn mint(
    subject: &str,
    user_label: Option<String>,
    liveness_score: f32,
    ttl_seconds: i64,
) -> (IssuedToken, TokenRecord) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

    let issued_at = Utc::now();
    let expires_at = issued_at + Duration::seconds(ttl_seconds);

    let record = TokenRecord {
        token_hash: hash_token(&token),
        subject: subject.to_string(),
        user_label,
        liveness_score,
        issued_at,
        expires_at,
        revoked: false,
    };

    log::info!("Minted credential for {} (expires {})", subject, expires_at);

    (IssuedToken { token, expires_at }, record)
}

/// Validate a presented credential against the store: it must exist, not be
/// revoked, and not be past expiry.
pub fn validate(token: &str, store: &dyn ChallengeStore) -> Result<TokenRecord, TokenError> {
    let record = store
        .get_token(&hash_token(token))?
        .ok_or(TokenError::NotFound)?;

    if record.revoked {
        return Err(TokenError::Revoked);
    }
    if record.expires_at < Utc::now() {
        return Err(TokenError::Expired);
    }

    Ok(record)
}
