//! Core types for the kite service mesh.
//!
//! This crate defines the data exchanged between kites and the Kontrol
//! directory: identities, credentials, tokens, directory queries and events,
//! and the structured error that travels back to callers. It contains no
//! networking.

pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod token;

pub use auth::Authentication;
pub use error::KiteError;
pub use identity::{KiteIdentity, KiteUrl, Visibility};
pub use protocol::{EventAction, KiteEvent, KiteWithToken, KontrolQuery, RegisterResult};
pub use token::{Token, TokenClaims};
