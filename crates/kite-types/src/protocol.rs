//! Kontrol directory protocol types.
//!
//! Kontrol exposes three methods to kites: `register`, `getKites` and
//! `getToken`. These are the argument and result shapes exchanged with it.

use crate::identity::KiteIdentity;
use crate::token::Token;
use serde::{Deserialize, Serialize};

/// Structural filter over identity fields. An empty field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KontrolQuery {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub environment: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
}

impl KontrolQuery {
    /// Query for all kites with the given name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether `kite` satisfies every non-empty field of the query.
    pub fn matches(&self, kite: &KiteIdentity) -> bool {
        let pairs = [
            (&self.username, &kite.username),
            (&self.environment, &kite.environment),
            (&self.name, &kite.name),
            (&self.version, &kite.version),
            (&self.region, &kite.region),
            (&self.hostname, &kite.hostname),
            (&self.id, &kite.id),
        ];
        pairs
            .iter()
            .all(|(want, have)| want.is_empty() || want == have)
    }
}

/// What happened to a kite in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Register,
    Remove,
    Update,
}

/// A directory change pushed to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KiteEvent {
    pub action: EventAction,
    pub kite: KiteIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
}

/// One entry of a `getKites` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KiteWithToken {
    pub kite: KiteIdentity,
    pub token: Token,
}

/// Result of the `register` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResult {
    pub result: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "publicIP")]
    pub public_ip: String,
}

/// Decoded form of [`RegisterResult::result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Allow,
    Reject,
    Other(String),
}

impl RegisterResult {
    pub const ALLOW_KITE: &'static str = "AllowKite";
    pub const REJECT_KITE: &'static str = "RejectKite";

    pub fn allow(username: impl Into<String>, public_ip: impl Into<String>) -> Self {
        Self {
            result: Self::ALLOW_KITE.to_string(),
            username: username.into(),
            public_ip: public_ip.into(),
        }
    }

    pub fn reject() -> Self {
        Self {
            result: Self::REJECT_KITE.to_string(),
            username: String::new(),
            public_ip: String::new(),
        }
    }

    pub fn outcome(&self) -> RegisterOutcome {
        match self.result.as_str() {
            Self::ALLOW_KITE => RegisterOutcome::Allow,
            Self::REJECT_KITE => RegisterOutcome::Reject,
            other => RegisterOutcome::Other(other.to_string()),
        }
    }
}
