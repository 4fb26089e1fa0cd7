//! Broker side of the burrow tunnel protocol
//!
//! Accepts agent control connections, authenticates them, keeps one session
//! per client id alive with heartbeats, binds the public ports agents
//! register, and pairs every public connection with a data channel opened by
//! the owning agent.
pub mod broker;
pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod listener;
pub mod pending_proxies;
pub mod registrar;
pub mod registry;
pub mod session;

pub use broker::{Broker, BrokerContext, BrokerError};
pub use config::{BrokerSettings, ConfigError};
pub use handler::{AuthError, ConnectionHandler};
pub use heartbeat::{HeartbeatExit, HeartbeatMonitor};
pub use listener::PortListener;
pub use pending_proxies::{DataChannel, PendingProxies};
pub use registrar::{PortPolicy, RegistrationError, TunnelRegistrar};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{Session, SessionState, TunnelDescriptor};
