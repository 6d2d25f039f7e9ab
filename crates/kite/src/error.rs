//! Errors surfaced to callers of remote kites and Kontrol.

use crate::transport::{ArgumentError, TransportError};
use kite_types::KiteError;
use thiserror::Error;

/// Failure of an outgoing call or a Kontrol operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Kontrol has no kite matching the query.
    #[error("no kites available")]
    NoKitesAvailable,
    /// Kontrol refused the registration.
    #[error("Kite rejected")]
    KiteRejected,
    /// Kontrol answered `register` with an unknown result.
    #[error("Invalid result: {0}")]
    InvalidResult(String),
    /// The peer delivered a structured error.
    #[error(transparent)]
    Remote(#[from] KiteError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Argument error: {0}")]
    Argument(#[from] ArgumentError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The remote kite has no connection yet. Call `dial` first.
    #[error("Remote kite {0} is not dialed")]
    NotDialed(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Whether the peer answered with a structured error of `kind`.
    pub fn is_remote(&self, kind: &str) -> bool {
        matches!(self, ClientError::Remote(err) if err.is(kind))
    }
}
