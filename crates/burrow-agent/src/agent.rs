//! Agent side of the tunnel protocol
//!
//! `connect` performs the outbound handshake (dial, authenticate, register
//! every tunnel). `run` then answers heartbeats and, for each `NewDataChannel`
//! the broker sends, dials the private target and a fresh data channel back
//! to the broker and splices the two together.

use crate::config::{AgentConfig, ConfigError};
use burrow_connection::{ConnectionError, ControlConnection, ForwardError, ForwardingPair};
use burrow_proto::{
    AuthRequest, CodecError, ControlMessage, DataChannelReady, NewDataChannel, ProtocolError,
    RegisterTunnelRequest, PROTOCOL_VERSION, TUNNEL_TYPE_TCP,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to broker {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Registration of tunnel '{name}' failed: {message}")]
    RegistrationFailed { name: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Control connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("No heartbeat from broker within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Agent is not connected")]
    NotConnected,

    #[error("Agent has been stopped")]
    Stopped,
}

/// A tunnel the broker accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTunnel {
    pub name: String,
    pub private_address: String,
    pub public_port: u16,
}

pub struct Agent {
    config: AgentConfig,
    connection: Option<Arc<ControlConnection>>,
    tunnels: HashMap<String, RegisteredTunnel>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            config,
            connection: None,
            tunnels: HashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| !connection.is_closed())
    }

    /// Tunnels confirmed by the broker, sorted by name
    pub fn registered_tunnels(&self) -> Vec<RegisteredTunnel> {
        let mut tunnels: Vec<_> = self.tunnels.values().cloned().collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));
        tunnels
    }

    /// Dial the broker, authenticate and register every configured tunnel
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        if self.shutdown.is_cancelled() {
            return Err(AgentError::Stopped);
        }

        let address = self.config.server_addr.clone();
        info!(server_addr = %address, client_id = %self.config.client_id, "Connecting to broker");
        let connection = ControlConnection::connect(address.as_str(), self.config.dial_timeout)
            .await
            .map_err(|source| AgentError::Dial {
                address: address.clone(),
                source,
            })?;

        let handshake = async {
            self.authenticate(&connection).await?;
            self.register_all(&connection).await
        };
        let registered = tokio::select! {
            _ = self.shutdown.cancelled() => Err(AgentError::Stopped),
            result = handshake => result,
        };

        let tunnels = match registered {
            Ok(tunnels) => tunnels,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };

        connection.set_read_deadline(None);
        self.tunnels = tunnels
            .into_iter()
            .map(|tunnel| (tunnel.name.clone(), tunnel))
            .collect();
        self.connection = Some(Arc::new(connection));
        Ok(())
    }

    /// Next reply during the handshake, answering any heartbeat that arrives first
    async fn handshake_reply(
        &self,
        connection: &ControlConnection,
    ) -> Result<ControlMessage, AgentError> {
        loop {
            connection.set_read_deadline(Some(Instant::now() + self.config.dial_timeout));
            match connection.recv_message().await? {
                ControlMessage::Ping => connection.send_message(&ControlMessage::Pong).await?,
                ControlMessage::Pong => {}
                message => return Ok(message),
            }
        }
    }

    async fn authenticate(&self, connection: &ControlConnection) -> Result<(), AgentError> {
        connection
            .send_message(&ControlMessage::Auth(AuthRequest {
                client_id: self.config.client_id.clone(),
                token: self.config.token.clone(),
                version: PROTOCOL_VERSION.to_string(),
            }))
            .await?;

        match self.handshake_reply(connection).await? {
            ControlMessage::AuthResult(result) if result.success => {
                info!(client_id = %self.config.client_id, "Authenticated with broker");
                Ok(())
            }
            ControlMessage::AuthResult(result) => Err(AgentError::AuthRejected(result.message)),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "AuthResult",
                actual: other.kind(),
            }
            .into()),
        }
    }

    async fn register_all(
        &self,
        connection: &ControlConnection,
    ) -> Result<Vec<RegisteredTunnel>, AgentError> {
        let mut registered = Vec::with_capacity(self.config.tunnels.len());

        for tunnel in &self.config.tunnels {
            connection
                .send_message(&ControlMessage::RegisterTunnel(RegisterTunnelRequest {
                    name: tunnel.name.clone(),
                    tunnel_type: TUNNEL_TYPE_TCP.to_string(),
                    private_address: tunnel.private_address.clone(),
                    public_port: tunnel.public_port,
                }))
                .await?;

            let result = match self.handshake_reply(connection).await? {
                ControlMessage::RegisterTunnelResult(result) => result,
                other => {
                    return Err(ProtocolError::UnexpectedMessage {
                        expected: "RegisterTunnelResult",
                        actual: other.kind(),
                    }
                    .into())
                }
            };
            if !result.success {
                return Err(AgentError::RegistrationFailed {
                    name: tunnel.name.clone(),
                    message: result.message,
                });
            }

            info!(
                tunnel = %tunnel.name,
                public_port = result.public_port,
                private_address = %tunnel.private_address,
                "Tunnel registered"
            );
            registered.push(RegisteredTunnel {
                name: tunnel.name.clone(),
                private_address: tunnel.private_address.clone(),
                public_port: result.public_port,
            });
        }

        Ok(registered)
    }

    /// Serve the control connection until it fails or `stop` is called
    pub async fn run(&self) -> Result<(), AgentError> {
        let connection = self.connection.clone().ok_or(AgentError::NotConnected)?;

        // Ends the heartbeat sender whichever way this loop exits
        let running = self.shutdown.child_token();
        let _stop_heartbeat = running.clone().drop_guard();
        self.tasks.spawn(heartbeat_sender(
            connection.clone(),
            self.config.heartbeat_interval,
            running,
        ));

        let read_timeout = self.config.heartbeat_timeout;
        loop {
            connection.set_read_deadline(Some(Instant::now() + read_timeout));
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                received = connection.recv_message() => received,
            };

            match received {
                Ok(ControlMessage::Ping) => connection.send_message(&ControlMessage::Pong).await?,
                Ok(ControlMessage::Pong) => debug!("Received heartbeat reply"),
                Ok(ControlMessage::NewDataChannel(request)) => self.dispatch(request),
                Ok(other) => warn!(kind = %other.kind(), "Unexpected message from broker"),
                Err(ConnectionError::Protocol(e)) => warn!("Ignoring malformed message: {}", e),
                Err(ConnectionError::Codec(CodecError::UnknownKind(kind))) => {
                    warn!(kind, "Ignoring message of unknown kind")
                }
                Err(ConnectionError::Timeout) => {
                    return Err(AgentError::HeartbeatTimeout(read_timeout))
                }
                Err(ConnectionError::Closed) if self.shutdown.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch(&self, request: NewDataChannel) {
        let Some(tunnel) = self.tunnels.get(&request.tunnel_name) else {
            error!(
                tunnel = %request.tunnel_name,
                proxy_id = %request.proxy_id,
                "Broker requested a data channel for an unknown tunnel"
            );
            return;
        };

        info!(tunnel = %request.tunnel_name, proxy_id = %request.proxy_id, "New data channel requested");
        let handler = DataChannelHandler {
            server_addr: self.config.server_addr.clone(),
            private_address: tunnel.private_address.clone(),
            dial_timeout: self.config.dial_timeout,
            proxy_id: request.proxy_id,
        };
        self.tasks.spawn(handler.run(self.shutdown.clone()));
    }

    /// Stop serving, close the control connection and wait for every spawned
    /// task. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(client_id = %self.config.client_id, "Stopping agent");
            self.shutdown.cancel();
        }
        if let Some(connection) = &self.connection {
            let _ = connection.close().await;
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn heartbeat_sender(
    connection: Arc<ControlConnection>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = connection.send_message(&ControlMessage::Ping).await {
            if !e.is_closed() {
                warn!("Failed to send heartbeat: {}", e);
            }
            break;
        }
        debug!("Sent heartbeat");
    }
}

/// Serves one `NewDataChannel` request
struct DataChannelHandler {
    server_addr: String,
    private_address: String,
    dial_timeout: Duration,
    proxy_id: String,
}

impl DataChannelHandler {
    async fn run(self, shutdown: CancellationToken) {
        let proxy_id = self.proxy_id.clone();
        let opened = tokio::select! {
            _ = shutdown.cancelled() => return,
            opened = self.open() => opened,
        };

        let pair = match opened {
            Ok(pair) => pair,
            Err(e) => {
                // The broker gives up on the public connection after its own timeout
                error!(proxy_id = %proxy_id, "Failed to open data channel: {}", e);
                return;
            }
        };

        match pair.run(shutdown).await {
            Ok(stats) => info!(
                proxy_id = %proxy_id,
                bytes_to_broker = stats.local_to_channel,
                bytes_from_broker = stats.channel_to_local,
                "Data channel closed"
            ),
            Err(ForwardError::Shutdown) => debug!(proxy_id = %proxy_id, "Data channel stopped"),
            Err(e) => warn!(proxy_id = %proxy_id, "Forwarding failed: {}", e),
        }
    }

    /// Dial the private target, then the broker, and announce readiness
    async fn open(&self) -> Result<ForwardingPair, AgentError> {
        let dial = TcpStream::connect(&self.private_address);
        let local = tokio::time::timeout(self.dial_timeout, dial)
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(ConnectionError::Io)?;
        local.set_nodelay(true).map_err(ConnectionError::Io)?;

        let channel = ControlConnection::connect(self.server_addr.as_str(), self.dial_timeout)
            .await
            .map_err(|source| AgentError::Dial {
                address: self.server_addr.clone(),
                source,
            })?;
        channel
            .send_message(&ControlMessage::DataChannelReady(DataChannelReady {
                proxy_id: self.proxy_id.clone(),
            }))
            .await?;

        debug!(
            proxy_id = %self.proxy_id,
            private_address = %self.private_address,
            "Data channel ready"
        );

        // Nothing has been read from the channel yet, so no bytes are buffered
        let (stream, buffered) = channel.into_parts()?;
        Ok(ForwardingPair::new(self.proxy_id.clone(), local, stream).with_buffered(buffered))
    }
}
