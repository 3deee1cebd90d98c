//! Configuration module for backupd.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file (`backupd.yml`), with loading, validation and defaults.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File name of the configuration file inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "backupd.yml";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for backupd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote backends by name.
    pub backends: BTreeMap<String, BackendConfig>,
    /// Local directories to back up.
    pub sources: Vec<SourceConfig>,
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
    pub cache: CacheConfig,
}

/// A remote backend: a service type plus free-form parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Service type tag, resolved through the service registry (e.g. `folder`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Service-specific string parameters.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// A watched local directory and where it is backed up to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Absolute local root directory.
    pub path: PathBuf,
    pub destination: DestinationConfig,
}

/// Where a source is stored within a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Name of an entry in `backends`.
    pub backend: String,
    /// Remote folder the local root maps to.
    pub folder: String,
    /// Request payload encryption (not supported yet).
    #[serde(default)]
    pub encrypt: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries of a transient service error before the message is dropped.
    pub max_retries: u32,
    /// Base delay of the exponential backoff between retries (ms).
    pub retry_base_delay_ms: u64,
}

/// Cache database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long to wait for another process to release a cache (ms).
    pub lock_timeout_ms: u64,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Platform-appropriate default configuration directory.
    ///
    /// Typically `$XDG_CONFIG_HOME/backupd` on Linux.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("backupd")
    }

    /// Platform-appropriate default data directory (cache databases).
    ///
    /// Typically `$XDG_DATA_HOME/backupd` on Linux.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("backupd")
    }
}

impl BackendConfig {
    /// Returns the parameter `key`, or `default` if it is not set.
    pub fn parameter<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.config.get(key).map(String::as_str).unwrap_or(default)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sources[0].destination.backend"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- backends ---
        for (name, backend) in &self.backends {
            if backend.kind.is_empty() {
                errors.push(ValidationError {
                    field: format!("backends.{name}.type"),
                    message: "must not be empty".into(),
                });
            }
        }

        // --- sources ---
        for (i, source) in self.sources.iter().enumerate() {
            if !source.path.is_absolute() {
                errors.push(ValidationError {
                    field: format!("sources[{i}].path"),
                    message: format!("must be absolute, got '{}'", source.path.display()),
                });
            }
            if !self.backends.contains_key(&source.destination.backend) {
                errors.push(ValidationError {
                    field: format!("sources[{i}].destination.backend"),
                    message: format!(
                        "backend '{}' is not configured",
                        source.destination.backend
                    ),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        // --- cache ---
        if self.cache.lock_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "cache.lock_timeout_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }
}
