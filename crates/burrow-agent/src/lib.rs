//! Agent side of burrow
//!
//! Runs inside the private network: keeps one control connection to the
//! broker, registers the configured tunnels, and serves each forwarded public
//! connection by dialing the private target.

pub mod agent;
pub mod config;

pub use agent::{Agent, AgentError, RegisteredTunnel};
pub use config::{AgentConfig, ConfigError, TunnelSpec};
