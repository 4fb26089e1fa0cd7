//! Session registry keyed by client id
//!
//! At most one session per client id. A reconnecting client evicts its
//! previous session; a session that exits on its own only removes the entry
//! if the entry still points at that exact instance.

use crate::session::Session;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Snapshot of one registered session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: String,
    pub peer_addr: std::net::SocketAddr,
    pub tunnels: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, evicting any session already registered under the
    /// same client id. The lookup, the eviction and the insert happen while
    /// holding the entry, so no observer sees both sessions or neither.
    /// The evicted session is already Closing when returned.
    pub fn insert_evicting(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        match self.sessions.entry(session.client_id().to_string()) {
            Entry::Occupied(mut entry) => {
                let evicted = entry.insert(session);
                evicted.begin_close();
                tracing::info!(
                    client_id = %evicted.client_id(),
                    old_peer_addr = %evicted.connection().peer_addr(),
                    old_connected_at = %evicted.connected_at(),
                    "Replaced existing session for reconnecting client"
                );
                Some(evicted)
            }
            Entry::Vacant(entry) => {
                entry.insert(session);
                None
            }
        }
    }

    /// Remove `session` only if it is still the registered instance
    pub fn remove_if_current(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.client_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All registered sessions at this moment
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let mut tunnels: Vec<String> =
                    session.tunnels().into_iter().map(|t| t.name).collect();
                tunnels.sort();
                SessionInfo {
                    client_id: session.client_id().to_string(),
                    peer_addr: session.connection().peer_addr(),
                    tunnels,
                    connected_at: session.connected_at(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::test_support::connection_pair;
    use burrow_connection::ControlConnection;
    use tokio_util::sync::CancellationToken;

    async fn session(client_id: &str) -> (Arc<Session>, ControlConnection) {
        let (agent, broker_side) = connection_pair().await;
        let session = Session::new(client_id, broker_side, &CancellationToken::new());
        (Arc::new(session), agent)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = SessionRegistry::new();
        let (s1, _a1) = session("office").await;

        assert!(registry.insert_evicting(s1.clone()).is_none());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("office").unwrap(), &s1));
        assert!(registry.get("home").is_none());
    }

    #[tokio::test]
    async fn test_new_session_evicts_old() {
        let registry = SessionRegistry::new();
        let (s1, _a1) = session("office").await;
        let (s2, _a2) = session("office").await;

        registry.insert_evicting(s1.clone());
        let evicted = registry.insert_evicting(s2.clone()).unwrap();

        assert!(Arc::ptr_eq(&evicted, &s1));
        assert_eq!(s1.state(), SessionState::Closing);
        assert!(s1.shutdown_token().is_cancelled());
        assert!(s2.is_active());
        assert!(Arc::ptr_eq(&registry.get("office").unwrap(), &s2));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_session_does_not_remove_replacement() {
        let registry = SessionRegistry::new();
        let (s1, _a1) = session("office").await;
        let (s2, _a2) = session("office").await;

        registry.insert_evicting(s1.clone());
        registry.insert_evicting(s2.clone());

        // The evicted session exits later and tries to clean up
        assert!(!registry.remove_if_current(&s1));
        assert!(Arc::ptr_eq(&registry.get("office").unwrap(), &s2));

        assert!(registry.remove_if_current(&s2));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let registry = SessionRegistry::new();
        let (a, _agent_a) = session("a").await;
        let (b, _agent_b) = session("b").await;
        registry.insert_evicting(a);
        registry.insert_evicting(b);

        let mut ids: Vec<String> = registry.list().into_iter().map(|i| i.client_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.sessions().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_reconnects_leave_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut sessions = Vec::new();
        let mut agents = Vec::new();
        for _ in 0..16 {
            let (s, a) = session("flappy").await;
            sessions.push(s);
            agents.push(a);
        }

        let handles: Vec<_> = sessions
            .iter()
            .cloned()
            .map(|s| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.insert_evicting(s) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 1);
        let winner = registry.get("flappy").unwrap();
        let active: Vec<_> = sessions.iter().filter(|s| s.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(active[0], &winner));
    }
}
