//! Loading kite options from a TOML file.

use kite_types::config::{ConfigError, KiteOptions};
use std::path::Path;
use tracing::info;

/// Read, parse and validate kite options from `path`.
///
/// ```toml
/// kitename = "math"
/// environment = "production"
/// region = "eu-west"
/// version = "1.0.0"
/// koding_key = "..."
/// kontrol_url = "wss://kontrol.example.com:4000/dnode"
/// ```
pub fn load_options(path: impl AsRef<Path>) -> Result<KiteOptions, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let mut options: KiteOptions =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    options.validate()?;
    info!(path = %path.display(), kite = %options.kitename, "Loaded kite options");
    Ok(options)
}
