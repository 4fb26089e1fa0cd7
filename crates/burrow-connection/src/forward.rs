//! Bidirectional byte forwarding between a local connection and a data channel

use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long the surviving direction may keep flowing after the other side
/// has reached end-of-stream
pub const DEFAULT_HALF_CLOSE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Forwarding IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forwarding aborted by shutdown")]
    Shutdown,
}

/// Byte counts for a completed pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub local_to_channel: u64,
    pub channel_to_local: u64,
    /// The second direction was cut off by the half-close grace period
    pub grace_expired: bool,
}

/// A local connection spliced to a data channel.
///
/// On the broker the local leg is the public user connection; on the agent it
/// is the connection to the private service.
pub struct ForwardingPair {
    proxy_id: String,
    local: TcpStream,
    channel: TcpStream,
    buffered: Bytes,
    half_close_grace: Duration,
}

enum Finished {
    Outbound(u64),
    Inbound(u64),
}

impl ForwardingPair {
    pub fn new(proxy_id: impl Into<String>, local: TcpStream, channel: TcpStream) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            local,
            channel,
            buffered: Bytes::new(),
            half_close_grace: DEFAULT_HALF_CLOSE_GRACE,
        }
    }

    /// Bytes already read off the data channel that belong to the local leg
    pub fn with_buffered(mut self, buffered: Bytes) -> Self {
        self.buffered = buffered;
        self
    }

    pub fn with_half_close_grace(mut self, grace: Duration) -> Self {
        self.half_close_grace = grace;
        self
    }

    /// Copy in both directions until both finish, an error occurs, or
    /// `shutdown` fires. Both sockets are closed when this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ForwardStats, ForwardError> {
        let ForwardingPair {
            proxy_id,
            local,
            channel,
            buffered,
            half_close_grace,
        } = self;

        let (mut local_read, mut local_write) = local.into_split();
        let (mut channel_read, mut channel_write) = channel.into_split();
        let mut stats = ForwardStats::default();

        if !buffered.is_empty() {
            local_write.write_all(&buffered).await?;
            stats.channel_to_local += buffered.len() as u64;
        }

        let outbound = pipe(&mut local_read, &mut channel_write);
        let inbound = pipe(&mut channel_read, &mut local_write);
        tokio::pin!(outbound);
        tokio::pin!(inbound);

        let finished = tokio::select! {
            _ = shutdown.cancelled() => return Err(ForwardError::Shutdown),
            result = &mut outbound => Finished::Outbound(result?),
            result = &mut inbound => Finished::Inbound(result?),
        };

        match finished {
            Finished::Outbound(copied) => {
                debug!(proxy_id = %proxy_id, bytes = copied, "Local side finished");
                stats.local_to_channel = copied;
                match drain(inbound.as_mut(), half_close_grace, &shutdown).await? {
                    Some(copied) => stats.channel_to_local += copied,
                    None => stats.grace_expired = true,
                }
            }
            Finished::Inbound(copied) => {
                debug!(proxy_id = %proxy_id, bytes = copied, "Data channel finished");
                stats.channel_to_local += copied;
                match drain(outbound.as_mut(), half_close_grace, &shutdown).await? {
                    Some(copied) => stats.local_to_channel = copied,
                    None => stats.grace_expired = true,
                }
            }
        }

        if stats.grace_expired {
            debug!(proxy_id = %proxy_id, "Half-close grace period expired");
        }

        Ok(stats)
    }
}

/// Copy until EOF, then propagate the half-close to the writer
async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await?;
    // The peer may already be gone; the copy result is what matters
    let _ = writer.shutdown().await;
    Ok(copied)
}

async fn drain<F>(
    remaining: F,
    grace: Duration,
    shutdown: &CancellationToken,
) -> Result<Option<u64>, ForwardError>
where
    F: Future<Output = std::io::Result<u64>>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(ForwardError::Shutdown),
        result = tokio::time::timeout(grace, remaining) => match result {
            Ok(copied) => Ok(Some(copied?)),
            Err(_) => Ok(None),
        },
    }
}
