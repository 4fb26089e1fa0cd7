//! Authenticated agent sessions

use burrow_connection::ControlConnection;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A public port mapped to an address the agent can reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    pub name: String,
    pub private_address: String,
    pub public_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One authenticated agent and everything it owns on the broker
pub struct Session {
    client_id: String,
    connection: ControlConnection,
    state: Mutex<SessionState>,
    last_active: Mutex<Instant>,
    tunnels: Mutex<HashMap<String, TunnelDescriptor>>,
    shutdown: CancellationToken,
    listeners: TaskTracker,
    connected_at: DateTime<Utc>,
}

impl Session {
    /// `parent` is the broker-wide shutdown token; cancelling it stops this
    /// session's loops and port listeners.
    pub fn new(
        client_id: impl Into<String>,
        connection: ControlConnection,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            connection,
            state: Mutex::new(SessionState::Active),
            last_active: Mutex::new(Instant::now()),
            tunnels: Mutex::new(HashMap::new()),
            shutdown: parent.child_token(),
            listeners: TaskTracker::new(),
            connected_at: Utc::now(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection(&self) -> &ControlConnection {
        &self.connection
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// Cancelled when the session starts closing or the broker shuts down
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Tracks this session's port listener loops
    pub fn listeners(&self) -> &TaskTracker {
        &self.listeners
    }

    pub fn has_tunnel(&self, name: &str) -> bool {
        lock(&self.tunnels).contains_key(name)
    }

    /// Returns false if a tunnel with the same name already exists
    pub fn add_tunnel(&self, descriptor: TunnelDescriptor) -> bool {
        let mut tunnels = lock(&self.tunnels);
        if tunnels.contains_key(&descriptor.name) {
            return false;
        }
        tunnels.insert(descriptor.name.clone(), descriptor);
        true
    }

    pub fn tunnels(&self) -> Vec<TunnelDescriptor> {
        lock(&self.tunnels).values().cloned().collect()
    }

    /// Move to Closing and signal every task serving this session.
    /// Synchronous so it can run inside the registry's critical section.
    /// Returns true for the call that performed the transition.
    pub fn begin_close(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != SessionState::Active {
            return false;
        }
        *state = SessionState::Closing;
        drop(state);

        self.shutdown.cancel();
        true
    }

    /// Close the control connection. Safe to call repeatedly.
    pub async fn close(&self) {
        self.begin_close();
        let _ = self.connection.close().await;
        *lock(&self.state) = SessionState::Closed;
    }

    /// Close, then wait up to `drain` for the port listeners to release their
    /// sockets. Returns false if they did not stop in time.
    pub async fn close_and_wait(&self, drain: Duration) -> bool {
        self.close().await;
        self.listeners.close();
        let stopped = tokio::time::timeout(drain, self.listeners.wait())
            .await
            .is_ok();
        debug!(client_id = %self.client_id, stopped, "Session listeners drained");
        stopped
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("peer_addr", &self.connection.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::connection_pair;

    #[tokio::test]
    async fn test_close_transitions_state() {
        let (_agent, broker_side) = connection_pair().await;
        let root = CancellationToken::new();
        let session = Session::new("agent-1", broker_side, &root);

        assert_eq!(session.state(), SessionState::Active);
        assert!(session.begin_close());
        assert!(!session.begin_close());
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.shutdown_token().is_cancelled());
        assert!(!root.is_cancelled());

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.connection().is_closed());
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_session() {
        let (_agent, broker_side) = connection_pair().await;
        let root = CancellationToken::new();
        let session = Session::new("agent-1", broker_side, &root);

        root.cancel();
        assert!(session.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_tunnel_names_unique() {
        let (_agent, broker_side) = connection_pair().await;
        let session = Session::new("agent-1", broker_side, &CancellationToken::new());

        let web = TunnelDescriptor {
            name: "web".to_string(),
            private_address: "127.0.0.1:3000".to_string(),
            public_port: 8080,
        };
        assert!(session.add_tunnel(web.clone()));
        assert!(!session.add_tunnel(web));
        assert!(session.has_tunnel("web"));
        assert_eq!(session.tunnels().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_time() {
        let (_agent, broker_side) = connection_pair().await;
        let session = Session::new("agent-1", broker_side, &CancellationToken::new());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(session.idle_for() >= Duration::from_secs(5));

        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_and_wait_stops_listeners() {
        let (_agent, broker_side) = connection_pair().await;
        let session = Session::new("agent-1", broker_side, &CancellationToken::new());

        let token = session.shutdown_token().clone();
        session.listeners().spawn(async move { token.cancelled().await });

        assert!(session.close_and_wait(Duration::from_secs(2)).await);
    }
}
