//! # Sable DNS configuration
//!
//! Typed configuration for the resolver manager: operating mode, cache
//! location, admission ceiling, and the timeout/TTL knobs. Loadable from
//! YAML, JSON, or TOML; every field has a sensible default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Operating mode of the manager. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Populate the cache; never emit change events.
    Prime,

    /// A cache miss is an error (replay runs against a primed cache).
    Force,

    /// Normal operation: look names up as they are requested.
    Default,

    /// Never query; answer deterministically from thin air.
    Fake,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Default
    }
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operating mode.
    pub mode: Mode,

    /// Directory holding the cache snapshot.
    pub dir: PathBuf,

    /// Snapshot file name within `dir`.
    pub cache_name: String,

    /// Ceiling on concurrently in-flight asynchronous requests.
    pub max_async_in_flight: usize,

    /// Wall-clock budget for a blocking lookup (seconds).
    pub sync_timeout: u64,

    /// Deadline for an asynchronous request (seconds).
    pub async_timeout: u64,

    /// Retention for negative answers (seconds).
    pub negative_ttl: u32,

    /// TTL applied when a response carries none (seconds).
    pub default_ttl: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            dir: PathBuf::from("."),
            cache_name: "dns_cache".to_string(),
            max_async_in_flight: 20,
            sync_timeout: 5,
            async_timeout: 5,
            negative_ttl: 60,
            default_ttl: 60,
        }
    }
}

impl Config {
    /// Loads configuration from a file, dispatching on the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?, // Default to YAML
        };

        Ok(config)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if self.max_async_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_async_in_flight".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.async_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "async_timeout".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }

        Ok(())
    }

    /// Full path of the cache snapshot file.
    pub fn cache_file(&self) -> PathBuf {
        self.dir.join(&self.cache_name)
    }
}
