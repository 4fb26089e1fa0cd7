//! Inbound connections awaiting their data channel
//!
//! Each accepted public connection registers its proxy id here before the
//! agent is notified. The data channel carrying that id removes the entry
//! and is handed to the waiting task. An id can be consumed only once.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// A data channel after its DataChannelReady frame has been read
#[derive(Debug)]
pub struct DataChannel {
    pub stream: TcpStream,
    /// Bytes already read past the ready frame
    pub buffered: Bytes,
    pub peer_addr: SocketAddr,
}

/// Proxy id -> waiter for the matching data channel
#[derive(Debug)]
pub struct PendingProxies<T = DataChannel> {
    waiters: DashMap<String, oneshot::Sender<T>>,
}

impl<T> PendingProxies<T> {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Register a proxy id and get the receiver its data channel arrives on
    pub fn register(&self, proxy_id: &str) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(proxy_id.to_string(), tx);
        debug!(proxy_id = %proxy_id, "Awaiting data channel");
        rx
    }

    /// Hand `channel` to the task waiting on `proxy_id`.
    ///
    /// The entry is removed first, so a second delivery for the same id fails.
    /// On failure (unknown, expired or abandoned id) the channel is returned
    /// to the caller to close.
    pub fn fulfill(&self, proxy_id: &str, channel: T) -> Result<(), T> {
        match self.waiters.remove(proxy_id) {
            Some((_, tx)) => tx.send(channel),
            None => Err(channel),
        }
    }

    /// Drop the waiter for `proxy_id` (timeout, notify failure, shutdown)
    pub fn cancel(&self, proxy_id: &str) -> bool {
        self.waiters.remove(proxy_id).is_some()
    }

    pub fn contains(&self, proxy_id: &str) -> bool {
        self.waiters.contains_key(proxy_id)
    }

    pub fn count(&self) -> usize {
        self.waiters.len()
    }
}

impl<T> Default for PendingProxies<T> {
    fn default() -> Self {
        Self::new()
    }
}
