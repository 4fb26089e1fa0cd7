//! Handles every connection accepted on the control address
//!
//! The first frame decides what the connection is: `Auth` opens a control
//! session, `DataChannelReady` completes a pending proxy handshake, anything
//! else is refused.

use crate::broker::BrokerContext;
use crate::config::READ_DEADLINE_GRACE;
use crate::heartbeat::HeartbeatMonitor;
use crate::listener::PortListener;
use crate::pending_proxies::DataChannel;
use crate::registrar::RegistrationError;
use crate::session::Session;
use burrow_connection::{ConnectionError, ControlConnection};
use burrow_proto::{
    AuthRequest, AuthResponse, ControlMessage, Frame, MessageKind, ProtocolError,
    RegisterTunnelRequest, RegisterTunnelResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed auth request")]
    Malformed(#[source] ProtocolError),

    #[error("client id must not be empty")]
    MissingClientId,

    #[error("invalid token")]
    InvalidToken,
}

/// Compare secrets without short-circuiting on the first differing byte
fn tokens_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
pub struct ConnectionHandler {
    ctx: Arc<BrokerContext>,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let connection = match ControlConnection::new(stream) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(peer_addr = %peer_addr, "Failed to set up connection: {}", e);
                return;
            }
        };

        connection.set_read_deadline(Some(Instant::now() + self.ctx.settings.auth_timeout));
        let first = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => {
                let _ = connection.close().await;
                return;
            }
            first = connection.recv() => first,
        };

        let frame = match first {
            Ok(frame) => frame,
            Err(ConnectionError::Timeout) => {
                warn!(peer_addr = %peer_addr, "No message before authentication deadline");
                let _ = connection.close().await;
                return;
            }
            Err(ConnectionError::Codec(e)) => {
                warn!(peer_addr = %peer_addr, "Malformed first frame: {}", e);
                let reply = ControlMessage::auth_failure(format!("malformed message: {}", e));
                let _ = connection.send_message(&reply).await;
                let _ = connection.close().await;
                return;
            }
            Err(e) => {
                debug!(peer_addr = %peer_addr, "Connection ended before first message: {}", e);
                let _ = connection.close().await;
                return;
            }
        };

        match frame.kind {
            MessageKind::Auth => self.handle_control(connection, &frame).await,
            MessageKind::DataChannelReady => self.handle_data_channel(connection, &frame).await,
            other => {
                warn!(peer_addr = %peer_addr, kind = %other, "Expected Auth as first message");
                let reply = ControlMessage::auth_failure(format!("expected Auth, got {}", other));
                let _ = connection.send_message(&reply).await;
                let _ = connection.close().await;
            }
        }
    }

    fn authenticate(&self, frame: &Frame) -> Result<AuthRequest, AuthError> {
        let request = match ControlMessage::from_frame(frame).map_err(AuthError::Malformed)? {
            ControlMessage::Auth(request) => request,
            other => {
                return Err(AuthError::Malformed(ProtocolError::UnexpectedMessage {
                    expected: "Auth",
                    actual: other.kind(),
                }))
            }
        };

        if request.client_id.trim().is_empty() {
            return Err(AuthError::MissingClientId);
        }
        if !tokens_match(&self.ctx.settings.token, &request.token) {
            return Err(AuthError::InvalidToken);
        }
        Ok(request)
    }

    async fn handle_control(&self, connection: ControlConnection, frame: &Frame) {
        let peer_addr = connection.peer_addr();
        let request = match self.authenticate(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer_addr = %peer_addr, "Authentication failed: {}", e);
                let _ = connection
                    .send_message(&ControlMessage::auth_failure(e.to_string()))
                    .await;
                let _ = connection.close().await;
                return;
            }
        };

        connection.set_read_deadline(None);
        let session = Arc::new(Session::new(
            request.client_id.clone(),
            connection,
            &self.ctx.shutdown,
        ));

        if let Some(evicted) = self.ctx.registry.insert_evicting(session.clone()) {
            // The replacement may re-register the same ports, so wait for the
            // old listeners to let go of them
            if !evicted.close_and_wait(self.ctx.settings.shutdown_drain).await {
                warn!(client_id = %request.client_id, "Evicted session's listeners did not stop in time");
            }
        }

        let accepted = ControlMessage::AuthResult(AuthResponse {
            success: true,
            message: "authenticated".to_string(),
        });
        if let Err(e) = session.connection().send_message(&accepted).await {
            warn!(client_id = %request.client_id, "Failed to confirm authentication: {}", e);
            self.finish_session(&session).await;
            return;
        }

        info!(
            client_id = %request.client_id,
            peer_addr = %peer_addr,
            version = %request.version,
            "Agent authenticated"
        );

        let monitor = HeartbeatMonitor::new(
            self.ctx.settings.heartbeat_interval,
            self.ctx.settings.heartbeat_timeout,
        );
        let monitored = session.clone();
        self.ctx.tasks.spawn(async move {
            let client_id = monitored.client_id().to_string();
            let exit = monitor.run(monitored).await;
            debug!(client_id = %client_id, ?exit, "Heartbeat monitor exited");
        });

        self.message_loop(&session).await;
        self.finish_session(&session).await;
    }

    async fn message_loop(&self, session: &Arc<Session>) {
        let connection = session.connection();
        let shutdown = session.shutdown_token().clone();
        let read_timeout = self.ctx.settings.heartbeat_timeout + READ_DEADLINE_GRACE;

        loop {
            connection.set_read_deadline(Some(Instant::now() + read_timeout));
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = connection.recv() => received,
            };

            let frame = match received {
                Ok(frame) => frame,
                Err(ConnectionError::Closed) => {
                    debug!(client_id = %session.client_id(), "Control connection closed");
                    break;
                }
                Err(ConnectionError::Timeout) => {
                    warn!(client_id = %session.client_id(), "Control connection read timed out");
                    break;
                }
                Err(e) => {
                    warn!(client_id = %session.client_id(), "Control connection failed: {}", e);
                    break;
                }
            };

            session.touch();

            let outcome = match ControlMessage::from_frame(&frame) {
                Ok(ControlMessage::Ping) => connection.send_message(&ControlMessage::Pong).await,
                Ok(ControlMessage::Pong) => {
                    debug!(client_id = %session.client_id(), "Received heartbeat reply");
                    Ok(())
                }
                Ok(ControlMessage::RegisterTunnel(request)) => {
                    self.register_tunnel(session, request).await
                }
                Err(e) if frame.kind == MessageKind::RegisterTunnel => {
                    let reason = RegistrationError::Malformed(e.to_string());
                    warn!(client_id = %session.client_id(), "Rejected tunnel registration: {}", reason);
                    connection
                        .send_message(&ControlMessage::register_failure("", reason.to_string()))
                        .await
                }
                Ok(other) => {
                    warn!(
                        client_id = %session.client_id(),
                        kind = %other.kind(),
                        "Unexpected message on control connection"
                    );
                    break;
                }
                Err(e) => {
                    warn!(client_id = %session.client_id(), "Protocol error: {}", e);
                    break;
                }
            };

            if let Err(e) = outcome {
                if !e.is_closed() {
                    warn!(client_id = %session.client_id(), "Failed to reply: {}", e);
                }
                break;
            }
        }
    }

    /// Validate, bind, confirm, then start accepting. Errors returned here
    /// are transport errors; refusals are answered and keep the session open.
    async fn register_tunnel(
        &self,
        session: &Arc<Session>,
        request: RegisterTunnelRequest,
    ) -> Result<(), ConnectionError> {
        let connection = session.connection();
        let registrar = &self.ctx.registrar;

        let descriptor = match registrar.validate(&request, |name| session.has_tunnel(name)) {
            Ok(descriptor) => descriptor,
            Err(e) => return self.refuse(session, &request.name, e).await,
        };

        let listener = match registrar.bind(&descriptor).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    client_id = %session.client_id(),
                    public_port = descriptor.public_port,
                    "Failed to bind tunnel port: {}", e
                );
                return self.refuse(session, &request.name, e).await;
            }
        };

        if !session.add_tunnel(descriptor.clone()) {
            let e = RegistrationError::DuplicateName(descriptor.name.clone());
            return self.refuse(session, &request.name, e).await;
        }

        let public_port = listener.local_addr()?.port();
        connection
            .send_message(&ControlMessage::RegisterTunnelResult(RegisterTunnelResponse {
                success: true,
                message: format!("tunnel '{}' listening on port {}", descriptor.name, public_port),
                name: descriptor.name.clone(),
                public_port,
            }))
            .await?;

        info!(
            client_id = %session.client_id(),
            tunnel = %descriptor.name,
            public_port,
            private_address = %descriptor.private_address,
            "Tunnel registered"
        );

        let port_listener =
            PortListener::new(listener, descriptor, session.clone(), self.ctx.clone());
        self.ctx
            .tasks
            .spawn(session.listeners().track_future(port_listener.run()));
        Ok(())
    }

    async fn refuse(
        &self,
        session: &Session,
        name: &str,
        reason: RegistrationError,
    ) -> Result<(), ConnectionError> {
        warn!(client_id = %session.client_id(), tunnel = %name, "Rejected tunnel registration: {}", reason);
        session
            .connection()
            .send_message(&ControlMessage::register_failure(name, reason.to_string()))
            .await
    }

    async fn finish_session(&self, session: &Arc<Session>) {
        let stopped = session.close_and_wait(self.ctx.settings.shutdown_drain).await;
        let removed = self.ctx.registry.remove_if_current(session);
        info!(
            client_id = %session.client_id(),
            removed,
            listeners_stopped = stopped,
            tunnels = session.tunnels().len(),
            "Session closed"
        );
    }

    async fn handle_data_channel(&self, connection: ControlConnection, frame: &Frame) {
        let peer_addr = connection.peer_addr();
        let ready = match ControlMessage::from_frame(frame) {
            Ok(ControlMessage::DataChannelReady(ready)) => ready,
            Ok(other) => {
                warn!(peer_addr = %peer_addr, kind = %other.kind(), "Expected DataChannelReady");
                let _ = connection.close().await;
                return;
            }
            Err(e) => {
                warn!(peer_addr = %peer_addr, "Malformed data channel handshake: {}", e);
                let _ = connection.close().await;
                return;
            }
        };

        let (stream, buffered) = match connection.into_parts() {
            Ok(parts) => parts,
            Err(e) => {
                warn!(peer_addr = %peer_addr, "Failed to recover data channel stream: {}", e);
                return;
            }
        };

        let channel = DataChannel {
            stream,
            buffered,
            peer_addr,
        };
        if self.ctx.pending.fulfill(&ready.proxy_id, channel).is_err() {
            // The returned channel is dropped here, closing the connection
            warn!(
                peer_addr = %peer_addr,
                proxy_id = %ready.proxy_id,
                "Unknown or expired proxy id, closing data channel"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secreT"));
        assert!(!tokens_match("secret", "secret2"));
        assert!(!tokens_match("secret", ""));
    }
}
