//! Per-session liveness monitor
//!
//! Every interval the monitor checks how long the session has been silent. A
//! session idle for longer than the timeout is closed even if its socket is
//! still open; otherwise a Ping is sent to keep the peer's own check happy.

use crate::session::Session;
use burrow_proto::ControlMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Why a monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The session was closed by someone else
    Stopped,
    /// No inbound traffic within the timeout
    TimedOut,
    /// A Ping could not be written
    SendFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub async fn run(self, session: Arc<Session>) -> HeartbeatExit {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = session.shutdown_token().clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return HeartbeatExit::Stopped,
                _ = ticker.tick() => {}
            }

            let idle = session.idle_for();
            if idle > self.timeout {
                warn!(
                    client_id = %session.client_id(),
                    idle_secs = idle.as_secs(),
                    "Heartbeat timeout, closing session"
                );
                session.close().await;
                return HeartbeatExit::TimedOut;
            }

            match session.connection().send_message(&ControlMessage::Ping).await {
                Ok(()) => debug!(client_id = %session.client_id(), "Sent heartbeat"),
                Err(e) if e.is_closed() => return HeartbeatExit::Stopped,
                Err(e) => {
                    warn!(client_id = %session.client_id(), "Failed to send heartbeat: {}", e);
                    session.close().await;
                    return HeartbeatExit::SendFailed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::test_support::connection_pair;
    use burrow_proto::MessageKind;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_sends_pings_while_peer_is_live() {
        let (agent, broker_side) = connection_pair().await;
        let session = Arc::new(Session::new("agent-1", broker_side, &CancellationToken::new()));

        let monitor = HeartbeatMonitor::new(Duration::from_millis(50), Duration::from_secs(5));
        let handle = tokio::spawn(monitor.run(session.clone()));

        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), agent.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.kind, MessageKind::Ping);
        }

        session.close().await;
        let exit = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, HeartbeatExit::Stopped);
    }

    #[tokio::test]
    async fn test_silent_session_times_out() {
        let (_agent, broker_side) = connection_pair().await;
        let session = Arc::new(Session::new("agent-1", broker_side, &CancellationToken::new()));

        let monitor = HeartbeatMonitor::new(Duration::from_millis(50), Duration::from_millis(120));
        let exit = tokio::time::timeout(Duration::from_secs(2), monitor.run(session.clone()))
            .await
            .unwrap();

        assert_eq!(exit, HeartbeatExit::TimedOut);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.connection().is_closed());
    }

    #[tokio::test]
    async fn test_touch_keeps_session_alive() {
        let (_agent, broker_side) = connection_pair().await;
        let session = Arc::new(Session::new("agent-1", broker_side, &CancellationToken::new()));

        let monitor = HeartbeatMonitor::new(Duration::from_millis(30), Duration::from_millis(100));
        let handle = tokio::spawn(monitor.run(session.clone()));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            session.touch();
        }
        assert!(session.is_active());

        session.begin_close();
        assert_eq!(handle.await.unwrap(), HeartbeatExit::Stopped);
    }
}
