//! Structured error returned to callers over the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error value carried in a response callback.
///
/// Only `type` and `message` are serialized. The `Display` output is for
/// local logs and never travels to peers.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Kite error: {kind}: {message}")]
pub struct KiteError {
    /// Error category, e.g. `authenticationError`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl KiteError {
    /// The caller's credential could not be verified.
    pub const AUTHENTICATION: &'static str = "authenticationError";
    /// The call arguments were malformed or had the wrong arity.
    pub const ARGUMENT: &'static str = "argumentError";
    /// Any other failure raised by a handler.
    pub const GENERIC: &'static str = "genericError";
    /// No handler is registered for the requested method.
    pub const METHOD_NOT_FOUND: &'static str = "methodNotFound";

    /// Create an error with an arbitrary kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(Self::AUTHENTICATION, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(Self::ARGUMENT, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(Self::GENERIC, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Whether this error has the given kind.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}
