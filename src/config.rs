//! Registry credentials file.
//!
//! ```json
//! { "registry": { "username": "alice", "password": "s3cret" } }
//! ```
//!
//! Both fields are optional. A missing file means anonymous access.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use pullbox_oci::Authenticator;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Path used when neither `--config` nor `PULLBOX_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_ENV: &str = "PULLBOX_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryCredentials,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "secret")]
    pub password: Option<SecretString>,
}

fn secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl Config {
    /// Load configuration from `path`. A missing file yields the default
    /// (anonymous) configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using anonymous access");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))
    }

    /// Basic credentials when both username and password are non-empty,
    /// anonymous otherwise.
    pub fn authenticator(&self) -> Authenticator {
        Authenticator::from_credentials(
            self.registry.username.as_deref(),
            self.registry.password.as_ref(),
        )
    }
}

/// Resolve the config path: explicit argument, then environment, then the
/// default.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
