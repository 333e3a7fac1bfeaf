//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Collection endpoint.
    pub endpoint: EndpointConfig,
    /// Credential source.
    pub auth: AuthConfig,
    /// Durable queue.
    pub storage: StorageConfig,
    /// Drain schedule and rejection policy.
    pub sync: SyncConfig,
    /// Reachability probing.
    pub connectivity: ConnectivityConfig,
    /// Simulated positioning source.
    pub capture: CaptureConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// # Example
    ///
    /// ```
    /// use trackline_agent::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.endpoint.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.sync.validate());
        errors.extend(self.connectivity.validate());
        errors.extend(self.capture.validate());
        errors.extend(self.logging.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Collection endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL; samples are posted to `{url}/track`.
    pub url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            timeout_secs: 10,
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.url.is_empty() {
            errors.push(ValidationError {
                field: "endpoint.url".to_string(),
                message: "endpoint URL cannot be empty".to_string(),
            });
        } else if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            errors.push(ValidationError {
                field: "endpoint.url".to_string(),
                message: format!(
                    "invalid URL '{}': must start with http:// or https://",
                    self.url
                ),
            });
        }

        if self.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "endpoint.timeout_secs".to_string(),
                message: "timeout must be at least 1 second".to_string(),
            });
        } else if self.timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(ValidationError {
                field: "endpoint.timeout_secs".to_string(),
                message: format!(
                    "timeout {} is too long (maximum {} seconds)",
                    self.timeout_secs, MAX_TIMEOUT_SECS
                ),
            });
        }

        errors
    }
}

/// Maximum request timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Credential settings. At most one of `token` and `token_file` may be set;
/// with neither, every sample is queued until a credential appears.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// File holding the bearer token, re-read on every use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
}

impl AuthConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.token.is_some() && self.token_file.is_some() {
            errors.push(ValidationError {
                field: "auth".to_string(),
                message: "set either token or token_file, not both".to_string(),
            });
        }
        if let Some(token) = &self.token
            && token.trim().is_empty()
        {
            errors.push(ValidationError {
                field: "auth.token".to_string(),
                message: "token cannot be empty (omit it instead)".to_string(),
            });
        }
        if let Some(path) = &self.token_file
            && path.as_os_str().is_empty()
        {
            errors.push(ValidationError {
                field: "auth.token_file".to_string(),
                message: "token file path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Maximum number of pending entries. Oldest entries beyond it are moved
    /// to the dead-letter table. Unbounded when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: trackline_store::default_db_path(),
            max_pending: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }
        if self.max_pending == Some(0) {
            errors.push(ValidationError {
                field: "storage.max_pending".to_string(),
                message: "max_pending must be > 0 (omit it for no limit)".to_string(),
            });
        }

        errors
    }
}

/// Drain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between timer-triggered drains.
    pub interval_secs: u64,
    /// Rejections after which an entry is quarantined. `0` retries rejected
    /// entries forever.
    pub max_rejections: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_rejections: 5,
        }
    }
}

/// Minimum drain interval in seconds.
pub const MIN_SYNC_INTERVAL: u64 = 5;
/// Maximum drain interval in seconds (1 day).
pub const MAX_SYNC_INTERVAL: u64 = 86_400;

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Rejection limit for the sync engine, `None` for no limit.
    pub fn rejection_limit(&self) -> Option<u32> {
        (self.max_rejections > 0).then_some(self.max_rejections)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_secs < MIN_SYNC_INTERVAL {
            errors.push(ValidationError {
                field: "sync.interval_secs".to_string(),
                message: format!(
                    "interval {} is too short (minimum {} seconds)",
                    self.interval_secs, MIN_SYNC_INTERVAL
                ),
            });
        } else if self.interval_secs > MAX_SYNC_INTERVAL {
            errors.push(ValidationError {
                field: "sync.interval_secs".to_string(),
                message: format!(
                    "interval {} is too long (maximum {} seconds / 1 day)",
                    self.interval_secs, MAX_SYNC_INTERVAL
                ),
            });
        }
        errors
    }
}

/// Reachability probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Seconds between probes. `0` disables periodic probing.
    pub probe_interval_secs: u64,
    /// TCP connect timeout for a probe, in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 15,
            probe_timeout_secs: 3,
        }
    }
}

impl ConnectivityConfig {
    /// Probe interval, or `None` when probing is disabled.
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.probe_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "connectivity.probe_timeout_secs".to_string(),
                message: "probe timeout must be at least 1 second".to_string(),
            });
        }
        if self.probe_interval_secs > 0 && self.probe_timeout_secs > self.probe_interval_secs {
            errors.push(ValidationError {
                field: "connectivity.probe_timeout_secs".to_string(),
                message: format!(
                    "probe timeout {} exceeds probe interval {}",
                    self.probe_timeout_secs, self.probe_interval_secs
                ),
            });
        }

        errors
    }
}

/// Simulated positioning source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Seconds between simulated fixes.
    pub interval_secs: u64,
    /// Starting latitude of the random walk.
    pub origin_latitude: f64,
    /// Starting longitude of the random walk.
    pub origin_longitude: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            origin_latitude: 52.52,
            origin_longitude: 13.405,
        }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_secs == 0 {
            errors.push(ValidationError {
                field: "capture.interval_secs".to_string(),
                message: "capture interval must be at least 1 second".to_string(),
            });
        }
        if !(-90.0..=90.0).contains(&self.origin_latitude) {
            errors.push(ValidationError {
                field: "capture.origin_latitude".to_string(),
                message: format!(
                    "latitude {} out of range (-90 to 90)",
                    self.origin_latitude
                ),
            });
        }
        if !(-180.0..=180.0).contains(&self.origin_longitude) {
            errors.push(ValidationError {
                field: "capture.origin_longitude".to_string(),
                message: format!(
                    "longitude {} out of range (-180 to 180)",
                    self.origin_longitude
                ),
            });
        }

        errors
    }
}

/// Logging settings. `RUST_LOG` takes precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for trackline crates.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LoggingConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !LOG_LEVELS.contains(&self.level.to_lowercase().as_str()) {
            errors.push(ValidationError {
                field: "logging.level".to_string(),
                message: format!(
                    "unknown level '{}': expected one of {}",
                    self.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `endpoint.url`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trackline")
        .join("agent.toml")
}
