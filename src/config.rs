//! Server configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Default UDP listening port.
pub const DEFAULT_PORT: u16 = 56070;

/// Configurable timeout values (seconds) for blocking flows.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Bound on the add→announce handshake wait.
    #[serde(default = "default_announce_seconds")]
    pub announce_seconds: u64,
    /// Grace period before a still-running child is force-killed at shutdown.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            announce_seconds: default_announce_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

fn default_announce_seconds() -> u64 {
    2
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_home() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || PathBuf::from("stagehand-sessions"),
        |home| Path::new(&home).join("stagehand-sessions"),
    )
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Server configuration parsed from `config.toml`, with CLI overrides
/// applied by the binary.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Home directory that contains all session directories.
    #[serde(default = "default_home")]
    pub home: PathBuf,
    /// UDP listening host.
    #[serde(default = "default_host")]
    pub host: String,
    /// UDP listening port. Zero requests an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timeout configuration for blocking flows.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            host: default_host(),
            port: default_port(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values. Called again by the binary after CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.home.as_os_str().is_empty() {
            return Err(AppError::Config("home must not be empty".into()));
        }
        if self.host.is_empty() {
            return Err(AppError::Config("host must not be empty".into()));
        }
        if self.timeouts.announce_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.announce_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Socket address string the server binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Bound on the add→announce handshake wait.
    #[must_use]
    pub fn announce_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.announce_seconds)
    }

    /// Grace period granted to children before a force-kill at shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_grace_seconds)
    }
}
