//! Kite identity and endpoint types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Who may discover a kite through Kontrol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Only the owning user sees the kite.
    #[default]
    Private,
    /// Every user may see the kite.
    Public,
}

/// Error returned when a kite URL cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("missing scheme in URL: {0}")]
    MissingScheme(String),
}

/// A kite endpoint, e.g. `ws://10.0.0.5:61001/dnode`.
///
/// `host` keeps the `host:port` form so the host part can be empty while the
/// port is already known (the host is filled in after registration).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct KiteUrl {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl KiteUrl {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
        }
    }

    /// Host part of `host`, without the port.
    pub fn hostname(&self) -> String {
        split_host_port(&self.host).0
    }

    /// Port part of `host`, empty when absent.
    pub fn port(&self) -> String {
        split_host_port(&self.host).1
    }
}

impl fmt::Display for KiteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)
    }
}

impl FromStr for KiteUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| UrlError::MissingScheme(s.to_string()))?;
        let (host, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        Ok(Self::new(scheme, host, path))
    }
}

impl From<KiteUrl> for String {
    fn from(url: KiteUrl) -> Self {
        url.to_string()
    }
}

impl TryFrom<String> for KiteUrl {
    type Error = UrlError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Split `host:port` into its parts. IPv6 hosts may be bracketed.
/// A missing port yields an empty port string.
pub fn split_host_port(hostport: &str) -> (String, String) {
    if let Some(rest) = hostport.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').unwrap_or("");
            return (host.to_string(), port.to_string());
        }
    }
    match hostport.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, _)) if host.contains(':') => (hostport.to_string(), String::new()),
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (hostport.to_string(), String::new()),
    }
}

/// Inverse of [`split_host_port`].
pub fn join_host_port(host: &str, port: &str) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port.is_empty() {
        host
    } else {
        format!("{host}:{port}")
    }
}

/// The identity a kite presents on every call and registers with Kontrol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiteIdentity {
    /// Owning user. Corrected by Kontrol on registration and forced to the
    /// credential's user after authentication.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub environment: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub hostname: String,
    /// Process-unique id.
    #[serde(default)]
    pub id: String,
    pub url: KiteUrl,
    #[serde(default)]
    pub visibility: Visibility,
}

impl KiteIdentity {
    /// Minimal identity with just a name and endpoint.
    pub fn named(name: impl Into<String>, url: KiteUrl) -> Self {
        Self {
            username: String::new(),
            environment: String::new(),
            name: name.into(),
            version: String::new(),
            region: String::new(),
            hostname: String::new(),
            id: String::new(),
            url,
            visibility: Visibility::default(),
        }
    }
}

impl fmt::Display for KiteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}/{}/{}/{}",
            self.username,
            self.environment,
            self.name,
            self.version,
            self.region,
            self.hostname,
            self.id
        )
    }
}
