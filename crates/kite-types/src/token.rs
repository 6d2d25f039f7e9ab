//! Access tokens issued by Kontrol.
//!
//! A token's `key` is a sealed [`TokenClaims`] blob: AES-256-GCM with a key
//! derived from the koding key (SHA-256), laid out as `nonce || ciphertext`
//! and encoded as URL-safe base64. Any kite sharing the koding key can open
//! it and check that the token was addressed to itself and has not expired.

use crate::auth::MAX_TTL_SECS;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Nonce length for AES-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// A token as it travels on the wire: opaque key plus lifetime in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub key: String,
    /// Seconds left. Issuers may send a negative value for a token that
    /// expired in transit.
    pub ttl: i64,
}

/// Errors from sealing or opening a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid Koding Key")]
    InvalidKodingKey,
    #[error("Invalid token encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Token is too short")]
    Truncated,
    #[error("Token could not be opened with this key")]
    Sealed,
    #[error("Token payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// What a token asserts about its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    /// User the holder acts as.
    pub username: String,
    /// Id of the kite the token is addressed to.
    pub audience: String,
    /// Who minted the token, usually `kontrol`.
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenClaims {
    pub fn new(
        username: impl Into<String>,
        audience: impl Into<String>,
        issuer: impl Into<String>,
        ttl: i64,
    ) -> Self {
        let issued_at = Utc::now();
        Self {
            username: username.into(),
            audience: audience.into(),
            issuer: issuer.into(),
            issued_at,
            expires_at: issued_at + Duration::seconds(ttl.clamp(0, MAX_TTL_SECS)),
        }
    }

    /// Whether the token is addressed to `kite_id` and not yet expired.
    pub fn is_valid(&self, kite_id: &str) -> bool {
        self.is_valid_at(kite_id, Utc::now())
    }

    pub fn is_valid_at(&self, kite_id: &str, now: DateTime<Utc>) -> bool {
        now < self.expires_at && self.audience == kite_id
    }

    /// Seal the claims with a key derived from `koding_key`.
    pub fn encrypt(&self, koding_key: &str) -> Result<String, TokenError> {
        let cipher = cipher_for(koding_key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(self)?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| TokenError::Sealed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Open a sealed token with a key derived from `koding_key`.
    pub fn decrypt(token: &str, koding_key: &str) -> Result<Self, TokenError> {
        let cipher = cipher_for(koding_key)?;
        let sealed = URL_SAFE_NO_PAD.decode(token)?;
        if sealed.len() <= NONCE_LEN {
            return Err(TokenError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Seal the claims into a wire token whose TTL is the time left now.
    pub fn issue(&self, koding_key: &str) -> Result<Token, TokenError> {
        let ttl = (self.expires_at - Utc::now()).num_seconds().max(0);
        Ok(Token {
            key: self.encrypt(koding_key)?,
            ttl,
        })
    }
}

impl fmt::Display for TokenClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "token for {} -> {} (expires {})",
            self.username,
            self.audience,
            self.expires_at.to_rfc3339()
        )
    }
}

fn cipher_for(koding_key: &str) -> Result<Aes256Gcm, TokenError> {
    if koding_key.is_empty() {
        return Err(TokenError::InvalidKodingKey);
    }
    let digest = Sha256::digest(koding_key.as_bytes());
    Ok(Aes256Gcm::new(&digest))
}
