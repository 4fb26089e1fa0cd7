//! Public port listeners
//!
//! One listener per registered tunnel. Each accepted connection gets a fresh
//! proxy id, the owning agent is told to open a data channel for it, and the
//! connection waits (bounded) for that channel before both are spliced
//! together.

use crate::broker::BrokerContext;
use crate::pending_proxies::DataChannel;
use crate::session::{Session, TunnelDescriptor};
use burrow_connection::{ForwardError, ForwardingPair};
use burrow_proto::{ControlMessage, NewDataChannel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop for one tunnel's public port
pub struct PortListener {
    listener: TcpListener,
    descriptor: TunnelDescriptor,
    session: Arc<Session>,
    ctx: Arc<BrokerContext>,
}

impl PortListener {
    pub fn new(
        listener: TcpListener,
        descriptor: TunnelDescriptor,
        session: Arc<Session>,
        ctx: Arc<BrokerContext>,
    ) -> Self {
        Self {
            listener,
            descriptor,
            session,
            ctx,
        }
    }

    /// Accept until the owning session stops. The socket is closed on return.
    pub async fn run(self) {
        let shutdown = self.session.shutdown_token().clone();
        info!(
            client_id = %self.session.client_id(),
            tunnel = %self.descriptor.name,
            public_port = self.descriptor.public_port,
            "Port listener started"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(
                        tunnel = %self.descriptor.name,
                        peer_addr = %peer_addr,
                        "Accepted public connection"
                    );
                    let inbound = InboundConnection {
                        stream,
                        peer_addr,
                        tunnel_name: self.descriptor.name.clone(),
                        session: self.session.clone(),
                        ctx: self.ctx.clone(),
                    };
                    self.ctx.tasks.spawn(inbound.handle());
                }
                Err(e) => {
                    error!(
                        tunnel = %self.descriptor.name,
                        "Failed to accept public connection: {}", e
                    );
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        info!(
            client_id = %self.session.client_id(),
            tunnel = %self.descriptor.name,
            public_port = self.descriptor.public_port,
            "Port listener stopped"
        );
    }
}

/// One public connection going through the data-channel handshake
struct InboundConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    tunnel_name: String,
    session: Arc<Session>,
    ctx: Arc<BrokerContext>,
}

impl InboundConnection {
    async fn handle(self) {
        let proxy_id = Uuid::new_v4().to_string();
        let Some(channel) = self.await_data_channel(&proxy_id).await else {
            // Dropping the stream closes the public connection
            return;
        };

        let pair = ForwardingPair::new(proxy_id.clone(), self.stream, channel.stream)
            .with_buffered(channel.buffered)
            .with_half_close_grace(self.ctx.settings.half_close_grace);

        match pair.run(self.ctx.shutdown.clone()).await {
            Ok(stats) => info!(
                proxy_id = %proxy_id,
                tunnel = %self.tunnel_name,
                peer_addr = %self.peer_addr,
                bytes_in = stats.local_to_channel,
                bytes_out = stats.channel_to_local,
                "Forwarding pair closed"
            ),
            Err(ForwardError::Shutdown) => {
                debug!(proxy_id = %proxy_id, "Forwarding pair stopped by shutdown")
            }
            Err(e) => warn!(proxy_id = %proxy_id, tunnel = %self.tunnel_name, "Forwarding failed: {}", e),
        }
    }

    async fn await_data_channel(&self, proxy_id: &str) -> Option<DataChannel> {
        let pending = &self.ctx.pending;
        // Must exist before the agent is notified
        let waiter = pending.register(proxy_id);

        if !self.session.is_active() {
            pending.cancel(proxy_id);
            debug!(proxy_id = %proxy_id, "Session gone, dropping public connection");
            return None;
        }

        let notify = ControlMessage::NewDataChannel(NewDataChannel {
            tunnel_name: self.tunnel_name.clone(),
            proxy_id: proxy_id.to_string(),
        });
        if let Err(e) = self.session.connection().send_message(&notify).await {
            pending.cancel(proxy_id);
            warn!(
                client_id = %self.session.client_id(),
                proxy_id = %proxy_id,
                "Failed to request data channel: {}", e
            );
            return None;
        }

        let timeout = self.ctx.settings.data_channel_timeout;
        let shutdown = self.session.shutdown_token();
        tokio::select! {
            _ = shutdown.cancelled() => {
                pending.cancel(proxy_id);
                debug!(proxy_id = %proxy_id, "Session closed while awaiting data channel");
                None
            }
            result = tokio::time::timeout(timeout, waiter) => match result {
                Ok(Ok(channel)) => {
                    debug!(
                        proxy_id = %proxy_id,
                        data_peer = %channel.peer_addr,
                        "Data channel matched"
                    );
                    Some(channel)
                }
                Ok(Err(_)) => None,
                Err(_) => {
                    pending.cancel(proxy_id);
                    warn!(
                        proxy_id = %proxy_id,
                        tunnel = %self.tunnel_name,
                        timeout_secs = timeout.as_secs_f64(),
                        "Timed out waiting for data channel"
                    );
                    None
                }
            },
        }
    }
}
