//! Broker lifecycle: bind, accept, stop

use crate::config::{BrokerSettings, ConfigError};
use crate::handler::ConnectionHandler;
use crate::pending_proxies::PendingProxies;
use crate::registrar::{PortPolicy, TunnelRegistrar};
use crate::registry::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind control address {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared by every task the broker spawns
pub struct BrokerContext {
    pub settings: BrokerSettings,
    pub registry: SessionRegistry,
    pub pending: PendingProxies,
    pub registrar: TunnelRegistrar,
    /// Broker-wide stop signal; session tokens are children of it
    pub shutdown: CancellationToken,
    /// Every spawned task, so `stop` can wait for all of them
    pub tasks: TaskTracker,
}

impl BrokerContext {
    pub fn new(settings: BrokerSettings) -> Self {
        let registrar = TunnelRegistrar::new(
            PortPolicy::new(settings.public_ports.iter().copied()),
            settings.public_bind_ip,
        );
        Self {
            settings,
            registry: SessionRegistry::new(),
            pending: PendingProxies::new(),
            registrar,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }
}

pub struct Broker {
    ctx: Arc<BrokerContext>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl Broker {
    /// Validate settings and bind the control address
    pub async fn bind(settings: BrokerSettings) -> Result<Self, BrokerError> {
        settings.validate()?;

        let listener = TcpListener::bind(&settings.control_addr)
            .await
            .map_err(|source| BrokerError::Bind {
                address: settings.control_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            ctx: Arc::new(BrokerContext::new(settings)),
            listener: Some(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub fn pending_proxies(&self) -> &PendingProxies {
        &self.ctx.pending
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.ctx.settings
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Start accepting control connections. Calling it again is a no-op.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            warn!("Broker already started");
            return;
        };

        info!(
            control_addr = %self.local_addr,
            public_ports = ?self.ctx.settings.public_ports,
            heartbeat_interval_secs = self.ctx.settings.heartbeat_interval.as_secs_f64(),
            heartbeat_timeout_secs = self.ctx.settings.heartbeat_timeout.as_secs_f64(),
            "Broker listening"
        );
        self.ctx.tasks.spawn(accept_loop(listener, self.ctx.clone()));
    }

    /// Stop accepting, close every session, listener and forwarding pair,
    /// and wait for all of their tasks to finish
    pub async fn stop(&mut self) {
        // Never started: the control socket is still held here
        self.listener.take();

        if !self.ctx.shutdown.is_cancelled() {
            let sessions = self.ctx.registry.list();
            info!(sessions = sessions.len(), "Stopping broker");
            for info in &sessions {
                debug!(
                    client_id = %info.client_id,
                    peer_addr = %info.peer_addr,
                    tunnels = ?info.tunnels,
                    connected_at = %info.connected_at,
                    "Closing session"
                );
            }
            self.ctx.shutdown.cancel();
        }
        for session in self.ctx.registry.sessions() {
            session.close().await;
        }

        self.ctx.tasks.close();
        let drain = self.ctx.settings.shutdown_drain;
        if tokio::time::timeout(drain, self.ctx.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.ctx.tasks.len(),
                "Tasks still running after {:?}, waiting for them", drain
            );
            self.ctx.tasks.wait().await;
        }
        info!("Broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<BrokerContext>) {
    let handler = ConnectionHandler::new(ctx.clone());

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let handler = handler.clone();
                ctx.tasks
                    .spawn(async move { handler.handle_connection(stream, peer_addr).await });
            }
            Err(e) => {
                error!("Failed to accept control connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!("Control listener stopped");
}
