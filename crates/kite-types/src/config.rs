//! Kite options with defaults and validation.

use crate::identity::{KiteUrl, Visibility};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("options.{0} field is not set")]
    MissingField(&'static str),
    #[error("please use 3-digits semantic versioning for options.version, got '{0}'")]
    InvalidVersion(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse options: {0}")]
    Parse(String),
}

/// Options used to build a local kite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KiteOptions {
    /// Default username adopted by peers that authenticate with the koding
    /// key but present no username of their own (Kontrol does this).
    pub username: String,
    pub kitename: String,
    /// Public address advertised to Kontrol. Left empty, Kontrol fills it in.
    pub public_ip: String,
    pub environment: String,
    pub region: String,
    /// Listening port. `"0"` lets the OS pick one.
    pub port: String,
    pub version: String,
    pub hostname: String,
    /// Shared secret used for koding-key authentication and token sealing.
    pub koding_key: String,
    pub kontrol_url: Option<KiteUrl>,
    pub disable_authentication: bool,
    pub dependencies: String,
    pub visibility: Visibility,
}

impl KiteOptions {
    /// Local fallback Kontrol address.
    pub fn default_kontrol_url() -> KiteUrl {
        KiteUrl::new("wss", "127.0.0.1:4000", "/dnode")
    }

    /// Check required fields and fill in defaults.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.kitename.is_empty() {
            return Err(ConfigError::MissingField("kitename"));
        }
        if self.region.is_empty() {
            return Err(ConfigError::MissingField("region"));
        }
        if self.environment.is_empty() {
            return Err(ConfigError::MissingField("environment"));
        }
        if self.port.is_empty() {
            self.port = "0".to_string();
        }
        let digits: Vec<&str> = self.version.split('.').collect();
        if digits.len() != 3 || digits.iter().any(|d| d.is_empty()) {
            return Err(ConfigError::InvalidVersion(self.version.clone()));
        }
        if self.kontrol_url.is_none() {
            self.kontrol_url = Some(Self::default_kontrol_url());
        }
        Ok(())
    }
}
