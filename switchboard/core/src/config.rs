//! Client Configuration
//!
//! Loaded from `~/.config/switchboard/client.toml` when present, then
//! overridden by `SWITCHBOARD_*` environment variables.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! handshake_timeout_ms = 10000
//! max_reconnect_attempts = 8
//!
//! [call_limit]
//! burst = 10
//! rate = 5
//!
//! [packet_limit]
//! b = 50
//! r = 100
//!
//! [reconnect]
//! base_ms = 250
//! max_ms = 30000
//! factor = 2.0
//! jitter = 0.2
//!
//! [transport]
//! connect_timeout_ms = 5000
//!
//! [transport.transport]
//! kind = "unix_socket"
//! path = "/run/user/1000/switchboard/switchboard.sock"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MuxError;
use crate::limit::{BackoffConfig, RateLimitConfig};
use crate::transport::{TransportConfig, TransportType};

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for MuxError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Settings for connecting and keeping a connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Which transport to open
    pub transport: TransportConfig,

    /// How long to wait for the server's hello, in milliseconds
    pub handshake_timeout_ms: u64,

    /// Call-start limiter used when the server advertises none
    pub call_limit: RateLimitConfig,

    /// Packet limiter used when the server advertises none
    pub packet_limit: RateLimitConfig,

    /// Delay policy between reconnection attempts
    pub reconnect: BackoffConfig,

    /// Consecutive failed attempts before giving up (None = never)
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            handshake_timeout_ms: 10_000,
            call_limit: RateLimitConfig::default_calls(),
            packet_limit: RateLimitConfig::default_packets(),
            reconnect: BackoffConfig::default(),
            max_reconnect_attempts: None,
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Parse a TOML document; missing keys keep their defaults
    ///
    /// # Errors
    ///
    /// [`ConfigError::ParseError`] for malformed TOML and
    /// [`ConfigError::ValidationError`] for unusable limiter or backoff values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (when it exists), then apply environment overrides
    ///
    /// A missing file is not an error; defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_path(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = path {
            if path.exists() {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
                        path: path.to_path_buf(),
                        source,
                    })?;
                config = Self::from_toml_str(&content)?;
                tracing::info!(path = %path.display(), "Loaded configuration from file");
            } else {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from the default path, then apply environment overrides
    ///
    /// # Errors
    ///
    /// See [`load_from_path`](Self::load_from_path).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(default_config_path().as_deref())
    }

    /// Check limiter and backoff parameters
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the offending section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sections = [
            ("call_limit", self.call_limit.validate()),
            ("packet_limit", self.packet_limit.validate()),
            ("reconnect", self.reconnect.validate()),
        ];
        for (name, result) in sections {
            if let Err(e) = result {
                return Err(ConfigError::ValidationError(format!("{name}: {e}")));
            }
        }
        Ok(())
    }

    /// Handshake timeout as a `Duration`
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Builder: set the transport
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Builder: set the handshake timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Builder: set the fallback call-start limiter
    #[must_use]
    pub fn with_call_limit(mut self, limit: RateLimitConfig) -> Self {
        self.call_limit = limit;
        self
    }

    /// Builder: set the fallback packet limiter
    #[must_use]
    pub fn with_packet_limit(mut self, limit: RateLimitConfig) -> Self {
        self.packet_limit = limit;
        self
    }

    /// Builder: set the reconnect backoff
    #[must_use]
    pub fn with_reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = backoff;
        self
    }

    /// Builder: cap consecutive reconnect attempts
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Apply environment variable overrides
    ///
    /// - `SWITCHBOARD_TRANSPORT`, `SWITCHBOARD_SOCKET`, `SWITCHBOARD_WS_URL`:
    ///   endpoint selection (see [`TransportType::from_env_name`])
    /// - `SWITCHBOARD_CONNECT_TIMEOUT`: connect timeout in ms
    /// - `SWITCHBOARD_HANDSHAKE_TIMEOUT`: handshake timeout in ms
    /// - `SWITCHBOARD_MAX_RECONNECTS`: reconnect attempt cap (0 = never give up)
    pub fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("SWITCHBOARD_TRANSPORT") {
            match TransportType::from_env_name(&name) {
                Some(transport) => self.transport.transport = transport,
                None => tracing::warn!(value = %name, "Ignoring unknown SWITCHBOARD_TRANSPORT"),
            }
        }
        if let Some(ms) = env_number("SWITCHBOARD_CONNECT_TIMEOUT") {
            self.transport.connect_timeout_ms = ms;
        }
        if let Some(ms) = env_number("SWITCHBOARD_HANDSHAKE_TIMEOUT") {
            self.handshake_timeout_ms = ms;
        }
        if let Some(attempts) = env_number::<u32>("SWITCHBOARD_MAX_RECONNECTS") {
            self.max_reconnect_attempts = (attempts > 0).then_some(attempts);
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(name, value = %value, "Ignoring non-numeric environment override");
            None
        }
    }
}

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/client.toml` or
/// `~/.config/switchboard/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("client.toml"))
}
