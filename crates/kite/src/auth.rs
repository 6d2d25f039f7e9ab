//! Call authentication.
//!
//! Each inbound call names its credential type. The local kite looks up the
//! authenticator registered for that type and runs it before the handler.
//! Calls arriving on connections this kite dialed itself are trusted.

use crate::request::Request;
use kite_types::token::{TokenClaims, TokenError};
use kite_types::KiteError;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

/// Rejection reasons from the built-in authenticators.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid Koding Key")]
    InvalidKodingKey,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("{0}")]
    Rejected(String),
}

impl Request {
    /// Verify the caller's credential.
    ///
    /// On success the caller's identity username is overwritten with the
    /// verified username so a kite cannot pose as another user's kite.
    pub fn authenticate(&mut self) -> Result<(), KiteError> {
        if self.remote_addr.is_empty() {
            return Ok(());
        }

        let kind = self
            .authentication
            .as_ref()
            .map(|auth| auth.kind.clone())
            .unwrap_or_default();
        let authenticator = self.local_kite.authenticator(&kind).ok_or_else(|| {
            KiteError::authentication(format!("Unknown authentication type: {kind}"))
        })?;

        authenticator(self).map_err(|e| KiteError::authentication(e.to_string()))?;

        self.remote_kite.set_username(&self.username);
        debug!(
            method = %self.method,
            username = %self.username,
            kind = %kind,
            "Call authenticated"
        );
        Ok(())
    }
}

fn presented_key(r: &Request) -> String {
    r.authentication
        .as_ref()
        .map(|auth| auth.key.clone())
        .unwrap_or_default()
}

/// Accept a Kontrol-issued token addressed to this kite.
pub(crate) fn authenticate_from_token(r: &mut Request) -> Result<(), AuthError> {
    let token = presented_key(r);
    let local = r.local_kite.clone();

    let claims =
        TokenClaims::decrypt(&token, &local.options().koding_key).map_err(|e| match e {
            TokenError::InvalidKodingKey => AuthError::InvalidKodingKey,
            _ => AuthError::InvalidToken(token.clone()),
        })?;

    if !claims.is_valid(local.id()) {
        return Err(AuthError::InvalidToken(claims.to_string()));
    }

    r.username = claims.username;
    Ok(())
}

/// Accept callers presenting the shared koding key. Kontrol calls this way.
/// A kite configured without a koding key accepts nobody this way.
pub(crate) fn authenticate_from_koding_key(r: &mut Request) -> Result<(), AuthError> {
    let local = r.local_kite.clone();
    let options = local.options();
    let expected = options.koding_key.as_bytes();
    let presented = presented_key(r);

    if expected.is_empty() || !bool::from(expected.ct_eq(presented.as_bytes())) {
        return Err(AuthError::InvalidKodingKey);
    }

    if r.username.is_empty() && !options.username.is_empty() {
        r.username = options.username.clone();
    }
    Ok(())
}
