//! Broker settings
//!
//! Settings are loaded from a YAML file with a top-level `broker:` key.
//! Durations are whole seconds; zero or missing values fall back to defaults.
//!
//! ```yaml
//! broker:
//!   control_addr: "0.0.0.0:7000"
//!   token: "change-me"
//!   heartbeat_interval: 30
//!   heartbeat_timeout: 90
//!   public_ports: [8080, 2222]
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Slack added to the heartbeat timeout when arming a session's read deadline
pub const READ_DEADLINE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// On-disk layout
#[derive(Debug, Deserialize, Serialize)]
pub struct BrokerConfigFile {
    pub broker: BrokerSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSection {
    pub control_addr: String,
    pub token: String,
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub public_ports: Vec<u16>,
    pub public_bind_ip: Option<IpAddr>,
    pub auth_timeout: u64,
    pub data_channel_timeout: u64,
    pub shutdown_drain: u64,
    pub log_level: Option<String>,
}

/// Runtime broker settings
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub control_addr: String,
    pub token: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Empty means every port may be registered
    pub public_ports: Vec<u16>,
    pub public_bind_ip: IpAddr,
    pub auth_timeout: Duration,
    pub data_channel_timeout: Duration,
    pub half_close_grace: Duration,
    pub shutdown_drain: Duration,
    pub log_level: String,
}

fn secs_or(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_secs(value)
    }
}

impl BrokerSettings {
    pub fn new(control_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            control_addr: control_addr.into(),
            token: token.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            public_ports: Vec::new(),
            public_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            data_channel_timeout: DEFAULT_DATA_CHANNEL_TIMEOUT,
            half_close_grace: burrow_connection::DEFAULT_HALF_CLOSE_GRACE,
            shutdown_drain: DEFAULT_SHUTDOWN_DRAIN,
            log_level: "info".to_string(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(path, None)
    }

    /// Load a file, replacing its token with `token_override` before validating
    pub fn load(path: &Path, token_override: Option<String>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::parse(&contents)?;
        if let Some(token) = token_override {
            settings.token = token;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let settings = Self::parse(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let file: BrokerConfigFile = serde_yaml::from_str(contents)?;
        Ok(Self::from_section(file.broker))
    }

    fn from_section(section: BrokerSection) -> Self {
        let mut settings = Self::new(section.control_addr, section.token);
        settings.heartbeat_interval =
            secs_or(section.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        settings.heartbeat_timeout = secs_or(section.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT);
        settings.public_ports = section.public_ports;
        if let Some(ip) = section.public_bind_ip {
            settings.public_bind_ip = ip;
        }
        settings.auth_timeout = secs_or(section.auth_timeout, DEFAULT_AUTH_TIMEOUT);
        settings.data_channel_timeout =
            secs_or(section.data_channel_timeout, DEFAULT_DATA_CHANNEL_TIMEOUT);
        settings.shutdown_drain = secs_or(section.shutdown_drain, DEFAULT_SHUTDOWN_DRAIN);
        if let Some(level) = section.log_level {
            settings.log_level = level;
        }
        settings
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_addr.trim().is_empty() {
            return Err(ConfigError::Missing("control_addr"));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                field: "heartbeat_timeout",
                reason: format!(
                    "{:?} is shorter than heartbeat_interval {:?}",
                    self.heartbeat_timeout, self.heartbeat_interval
                ),
            });
        }
        if self.public_ports.contains(&0) {
            return Err(ConfigError::Invalid {
                field: "public_ports",
                reason: "ports must be between 1 and 65535".to_string(),
            });
        }
        Ok(())
    }
}
