//! Manages the `/etc/jittertrap.conf` file.
//!
//! The daemon runs fine with no file at all: every field has a default,
//! and a missing file simply yields the default configuration.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jittertrap.conf";

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("unable to read {path}: {source}")]
    ReadFailed {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("unable to parse configuration: {0}")]
    ParseError(#[from] toml_edit::de::Error),
    /// The parsed configuration fails validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sample_period_us() -> u32 {
    1000
}

/// Top-level configuration for the JitterTrap daemon.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Address and port the web server listens on.
    #[serde(default = "default_listen")]
    pub webserver_listen: String,

    /// Interfaces clients may select for sampling. An empty list
    /// allows every interface present on the system.
    #[serde(default)]
    pub allowed_interfaces: Vec<String>,

    /// Interface sampled at startup, before any client selects one.
    /// When unset, the first allowed interface is used.
    #[serde(default)]
    pub default_interface: Option<String>,

    /// Initial sample period in microseconds.
    #[serde(default = "default_sample_period_us")]
    pub sample_period_us: u32,

    /// CPU to pin the sampling thread to. Unset means no pinning.
    #[serde(default)]
    pub rt_cpu: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webserver_listen: default_listen(),
            allowed_interfaces: Vec::new(),
            default_interface: None,
            sample_period_us: default_sample_period_us(),
            rt_cpu: None,
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, falling back to the
    /// defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_string(&raw)
    }

    /// Parses a configuration from a TOML string.
    pub fn load_from_string(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml_edit::de::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.webserver_listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "webserver_listen is not a socket address: {}",
                self.webserver_listen
            )));
        }
        if let Some(iface) = &self.default_interface {
            if !self.allowed_interfaces.is_empty() && !self.allowed_interfaces.contains(iface) {
                return Err(ConfigError::Invalid(format!(
                    "default_interface {iface} is not in allowed_interfaces"
                )));
            }
        }
        Ok(())
    }

    /// Whether clients may select `iface` for sampling.
    pub fn interface_allowed(&self, iface: &str) -> bool {
        self.allowed_interfaces.is_empty()
            || self.allowed_interfaces.iter().any(|allowed| allowed == iface)
    }
}
