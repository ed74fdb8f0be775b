//! Configuration management for the nsc CLI
//!
//! Configuration is stored in TOML format.
//!
//! # Configuration File Locations
//!
//! - Linux: `~/.config/nsc/cli.toml`
//! - macOS: `~/Library/Application Support/org.nsc.nsc/cli.toml`
//! - Windows: `%APPDATA%\nsc\nsc\config\cli.toml`

use std::path::{Path, PathBuf};

use nsc_core::ConnectTimings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// CLI configuration
///
/// # Example TOML
///
/// ```toml
/// [connect]
/// grace_window_ms = 3000
/// signer_wait_timeout_ms = 120000
///
/// [request]
/// relays = ["wss://relay.nsec.app"]
/// app_name = "nsc"
/// perms = ["sign_event:22242"]
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
/// verbose = false
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection timings handed to the state machine
    #[serde(default)]
    pub connect: ConnectTimings,

    /// Parameters for `nostrconnect://` requests
    #[serde(default)]
    pub request: RequestConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connect request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Relays advertised in the connect request
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// App name shown by the signer
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Requested permissions
    #[serde(default = "default_perms")]
    pub perms: Vec<String>,

    /// Client public key (hex); may also be given with `--client-pubkey`
    #[serde(default)]
    pub client_pubkey: Option<String>,
}

fn default_relays() -> Vec<String> {
    vec!["wss://relay.nsec.app".to_string()]
}

fn default_app_name() -> String {
    "nsc".to_string()
}

fn default_perms() -> Vec<String> {
    vec!["sign_event:22242".to_string()]
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            app_name: default_app_name(),
            perms: default_perms(),
            client_pubkey: None,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "table", "json", "quiet"
    #[serde(default = "default_format")]
    pub format: String,

    /// Verbose output
    #[serde(default)]
    pub verbose: bool,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            verbose: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive, e.g. "warn" or "nsc_core=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (unset = stderr only)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = custom_path {
            Self::load(path)
        } else {
            Self::load_default()
        }
    }

    /// Get default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("cli.toml"))
    }

    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "nsc", "nsc")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connect
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let valid_formats = ["table", "json", "quiet"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, valid_formats
            )));
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'",
                self.logging.level
            )));
        }

        for relay in &self.request.relays {
            if !relay.starts_with("wss://") && !relay.starts_with("ws://") {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid relay URL '{}': must start with ws:// or wss://",
                    relay
                )));
            }
        }

        if let Some(key) = &self.request.client_pubkey {
            nsc_core::PublicKey::from_hex(key).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid client_pubkey: {e}"))
            })?;
        }

        Ok(())
    }

    /// Generate a sample configuration file content
    pub fn sample_toml() -> &'static str {
        r#"# nsc CLI configuration

[connect]
# Window in which a late approval URL overrides a secret rejection
grace_window_ms = 3000
# Pause between "connected" and starting sign-in
settle_delay_ms = 500
# Informational "taking longer than expected" threshold
slow_warning_ms = 15000
# Hard timeout while waiting for a signer
signer_wait_timeout_ms = 120000
# Hard timeout for the sign-in exchange
auth_timeout_ms = 30000
# Upper bound on approval retries for one bunker URL
max_approval_retries = 5

[request]
relays = ["wss://relay.nsec.app"]
app_name = "nsc"
perms = ["sign_event:22242"]
# client_pubkey = "<64 hex chars>"

[output]
# "table", "json" or "quiet"
format = "table"
verbose = false

[logging]
# "error", "warn", "info", "debug", "trace" or a filter directive
level = "warn"
# file = "/tmp/nsc.log"
"#
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Output format override
    pub output_format: Option<String>,
    /// Verbose flag override
    pub verbose: Option<bool>,
    /// Debug flag override
    pub debug: Option<bool>,
    /// Relay URLs override
    pub relays: Option<Vec<String>>,
    /// Grace window override in milliseconds
    pub grace_window_ms: Option<u64>,
}

impl Config {
    /// Apply CLI overrides to configuration
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref format) = overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(verbose) = overrides.verbose {
            self.output.verbose = verbose;
        }
        if let Some(true) = overrides.debug {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref relays) = overrides.relays {
            if !relays.is_empty() {
                self.request.relays = relays.clone();
            }
        }
        if let Some(ms) = overrides.grace_window_ms {
            self.connect.grace_window_ms = ms;
        }
        self
    }
}
