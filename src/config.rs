//! Server configuration.
//!
//! Built from defaults, then an optional YAML file named by `KEEL_CONFIG`,
//! then the `LISTEN` environment variable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::error::HttpError;
use crate::http::limits::Limits;
use crate::http::timeout::MinDataRate;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid limits: {0}")]
    Invalid(#[from] HttpError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            limits: Limits::default(),
        }
    }
}

/// On-disk shape of the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub listen_addr: String,
    pub limits: LimitsConfig,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Limits as written in YAML. A missing rate disables that rate check.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_request_line_size: usize,
    pub max_request_headers_total_size: usize,
    pub max_request_header_count: usize,
    pub max_request_body_size: Option<u64>,
    pub min_request_body_bytes_per_second: Option<f64>,
    pub min_request_body_grace_secs: u64,
    pub min_response_bytes_per_second: Option<f64>,
    pub min_response_grace_secs: u64,
    pub keep_alive_timeout_secs: u64,
    pub request_headers_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_line_size: 8192,
            max_request_headers_total_size: 32768,
            max_request_header_count: 100,
            max_request_body_size: Some(30_000_000),
            min_request_body_bytes_per_second: Some(240.0),
            min_request_body_grace_secs: 5,
            min_response_bytes_per_second: Some(240.0),
            min_response_grace_secs: 5,
            keep_alive_timeout_secs: 130,
            request_headers_timeout_secs: 30,
        }
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> Result<Limits, ConfigError> {
        let rate = |bps: Option<f64>, grace: u64| {
            bps.map(|bps| MinDataRate::new(bps, Duration::from_secs(grace)))
                .transpose()
        };
        let limits = Limits {
            max_request_line_size: self.max_request_line_size,
            max_request_headers_total_size: self.max_request_headers_total_size,
            max_request_header_count: self.max_request_header_count,
            max_request_body_size: self.max_request_body_size,
            min_request_body_data_rate: rate(
                self.min_request_body_bytes_per_second,
                self.min_request_body_grace_secs,
            )?,
            min_response_data_rate: rate(
                self.min_response_bytes_per_second,
                self.min_response_grace_secs,
            )?,
            keep_alive_timeout: Duration::from_secs(self.keep_alive_timeout_secs),
            request_headers_timeout: Duration::from_secs(self.request_headers_timeout_secs),
        };
        limits.validate()?;
        Ok(limits)
    }
}

impl Config {
    /// Reads `KEEL_CONFIG` and `LISTEN` from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("KEEL_CONFIG").ok();
        let listen = std::env::var("LISTEN").ok();
        Self::load_from(path.as_deref().map(Path::new), listen)
    }

    /// Same as [`Config::load`] with the environment passed in.
    pub fn load_from(path: Option<&Path>, listen_override: Option<String>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&content)?
            }
            None => ConfigFile::default(),
        };
        let mut config = Self::from_file(&file)?;
        if let Some(listen) = listen_override {
            config.listen_addr = listen;
        }
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        Self::from_file(&file)
    }

    fn from_file(file: &ConfigFile) -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: file.listen_addr.clone(),
            limits: file.limits.to_limits()?,
        })
    }
}
