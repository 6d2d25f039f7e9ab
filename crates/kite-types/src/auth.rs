//! Credentials presented on every call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for a token lifetime, keeps expiry arithmetic in range.
pub(crate) const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// The credential a kite presents to a peer.
///
/// Tagged by `type`. The two built-in types are [`Authentication::KODING_KEY`]
/// (long-lived shared secret) and [`Authentication::TOKEN`] (short-lived,
/// issued by Kontrol). Other tags are accepted so that a local service can
/// register its own authenticators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    /// Absolute expiry computed locally when the token was received.
    /// Never sent on the wire.
    #[serde(skip)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl Authentication {
    pub const KODING_KEY: &'static str = "kodingKey";
    pub const TOKEN: &'static str = "token";

    pub fn koding_key(key: impl Into<String>) -> Self {
        Self {
            kind: Self::KODING_KEY.to_string(),
            key: key.into(),
            valid_until: None,
        }
    }

    /// A token credential received now with `ttl` seconds to live.
    ///
    /// Expiry is the local receipt time plus the TTL, so clock skew between
    /// issuer and holder shifts the effective lifetime. A negative TTL, as
    /// sent for a token on the edge of expiry, gives an expired credential.
    pub fn token(key: impl Into<String>, ttl: i64) -> Self {
        Self::token_received_at(key, ttl, Utc::now())
    }

    pub fn token_received_at(
        key: impl Into<String>,
        ttl: i64,
        received_at: DateTime<Utc>,
    ) -> Self {
        let ttl = Duration::seconds(ttl.clamp(0, MAX_TTL_SECS));
        Self {
            kind: Self::TOKEN.to_string(),
            key: key.into(),
            valid_until: Some(received_at + ttl),
        }
    }

    /// Whether the credential can still be used at `at`.
    /// Credentials without an expiry never expire.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        match self.valid_until {
            Some(until) => at < until,
            None => true,
        }
    }

    /// Whole seconds left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> i64 {
        match self.valid_until {
            Some(until) => (until - now).num_seconds().max(0),
            None => 0,
        }
    }
}
