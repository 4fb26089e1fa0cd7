//! Agent configuration
//!
//! Loaded from YAML with a top-level `agent:` key:
//!
//! ```yaml
//! agent:
//!   server_addr: "broker.example.com:7000"
//!   token: "change-me"
//!   client_id: "office-nas"
//!   tunnels:
//!     - name: ssh
//!       private_address: "127.0.0.1:22"
//!       public_port: 2222
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

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

/// One tunnel the agent asks the broker to expose
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelSpec {
    pub name: String,
    /// host:port dialed for every forwarded connection
    pub private_address: String,
    pub public_port: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AgentConfigFile {
    pub agent: AgentSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    pub server_addr: String,
    pub token: String,
    pub client_id: Option<String>,
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub dial_timeout: u64,
    pub log_level: Option<String>,
    pub tunnels: Vec<TunnelSpec>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    pub token: String,
    pub client_id: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub dial_timeout: Duration,
    pub log_level: String,
    pub tunnels: Vec<TunnelSpec>,
}

fn secs_or(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_secs(value)
    }
}

fn generated_client_id() -> String {
    format!("agent-{}", Uuid::new_v4())
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            client_id: generated_client_id(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            log_level: "info".to_string(),
            tunnels: Vec::new(),
        }
    }

    pub fn with_tunnel(
        mut self,
        name: impl Into<String>,
        private_address: impl Into<String>,
        public_port: u16,
    ) -> Self {
        self.tunnels.push(TunnelSpec {
            name: name.into(),
            private_address: private_address.into(),
            public_port: public_port as u32,
        });
        self
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
        let mut config = Self::parse(&contents)?;
        if let Some(token) = token_override {
            config.token = token;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let file: AgentConfigFile = serde_yaml::from_str(contents)?;
        let section = file.agent;

        let mut config = Self::new(section.server_addr, section.token);
        if let Some(client_id) = section.client_id.filter(|id| !id.trim().is_empty()) {
            config.client_id = client_id;
        }
        config.heartbeat_interval =
            secs_or(section.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        config.heartbeat_timeout = secs_or(section.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT);
        config.dial_timeout = secs_or(section.dial_timeout, DEFAULT_DIAL_TIMEOUT);
        if let Some(level) = section.log_level {
            config.log_level = level;
        }
        config.tunnels = section.tunnels;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_addr.trim().is_empty() {
            return Err(ConfigError::Missing("server_addr"));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("client_id"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "dial_timeout",
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
        if self.tunnels.is_empty() {
            return Err(ConfigError::Missing("tunnels"));
        }

        let mut names = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.name.trim().is_empty() {
                return Err(ConfigError::Missing("tunnels.name"));
            }
            if !names.insert(tunnel.name.as_str()) {
                return Err(ConfigError::Invalid {
                    field: "tunnels.name",
                    reason: format!("duplicate tunnel name '{}'", tunnel.name),
                });
            }
            validate_host_port(&tunnel.private_address).map_err(|reason| ConfigError::Invalid {
                field: "tunnels.private_address",
                reason,
            })?;
            if tunnel.public_port == 0 || tunnel.public_port > u16::MAX as u32 {
                return Err(ConfigError::Invalid {
                    field: "tunnels.public_port",
                    reason: format!(
                        "{} for tunnel '{}' is out of range (1-65535)",
                        tunnel.public_port, tunnel.name
                    ),
                });
            }
        }

        Ok(())
    }
}

fn validate_host_port(address: &str) -> Result<(), String> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(format!("'{}' is not in host:port form", address));
    };
    if host.is_empty() {
        return Err(format!("'{}' has no host", address));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{}' has an invalid port", address)),
        Ok(_) => Ok(()),
    }
}
