//! Framed control connection over TCP
//!
//! The stream is split into owned halves so the send and receive paths never
//! contend with each other. Each path is serialized by its own async mutex,
//! which lets a heartbeat task send while the message loop is blocked in
//! `recv`. Closing is signalled through a cancellation token so that pending
//! sends and receives return promptly with [`ConnectionError::Closed`].

use burrow_proto::{CodecError, ControlMessage, Frame, FrameCodec, ProtocolError};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Control connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Deadline exceeded")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionError::Closed)
    }
}

struct ReadState {
    half: OwnedReadHalf,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl ReadState {
    /// Cancellation safe: bytes read before the future is dropped stay in
    /// `buffer` and are picked up by the next call.
    async fn read_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let read = self.half.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return match self.codec.decode_eof(&mut self.buffer)? {
                    Some(frame) => Ok(frame),
                    None => Err(ConnectionError::Closed),
                };
            }
        }
    }
}

/// One framed connection between a broker and an agent
pub struct ControlConnection {
    reader: Mutex<ReadState>,
    writer: Mutex<OwnedWriteHalf>,
    read_deadline: std::sync::Mutex<Option<Instant>>,
    closing: AtomicBool,
    closed: CancellationToken,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl ControlConnection {
    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream) -> Result<Self, ConnectionError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(ReadState {
                half: read_half,
                buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
                codec: FrameCodec::new(),
            }),
            writer: Mutex::new(write_half),
            read_deadline: std::sync::Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            peer_addr,
            local_addr,
        })
    }

    /// Dial `addr`, failing with [`ConnectionError::Timeout`] after `timeout`
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Arm (or clear with `None`) an absolute deadline for subsequent receives
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut guard = self
            .read_deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = deadline;
    }

    fn current_read_deadline(&self) -> Option<Instant> {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send one frame. Frames from concurrent callers never interleave.
    pub async fn send(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let encoded = FrameCodec::encode_frame(frame)?;
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&encoded).await
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ConnectionError::Closed),
            result = write => {
                result?;
                trace!(peer_addr = %self.peer_addr, kind = %frame.kind, len = frame.body.len(), "Sent frame");
                Ok(())
            }
        }
    }

    pub async fn send_message(&self, message: &ControlMessage) -> Result<(), ConnectionError> {
        let frame = message.to_frame()?;
        self.send(&frame).await
    }

    /// Receive the next frame, honouring the current read deadline
    pub async fn recv(&self) -> Result<Frame, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let deadline = self.current_read_deadline();
        let read = async {
            let mut state = self.reader.lock().await;
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, state.read_frame())
                    .await
                    .unwrap_or(Err(ConnectionError::Timeout)),
                None => state.read_frame().await,
            }
        };

        let frame = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ConnectionError::Closed),
            result = read => result?,
        };

        trace!(peer_addr = %self.peer_addr, kind = %frame.kind, len = frame.body.len(), "Received frame");
        Ok(frame)
    }

    pub async fn recv_message(&self) -> Result<ControlMessage, ConnectionError> {
        let frame = self.recv().await?;
        Ok(ControlMessage::from_frame(&frame)?)
    }

    /// Close the connection. Only the first call has any effect.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.closed.cancel();

        // Pending sends observe the token and release the writer
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer_addr = %self.peer_addr, "Shutdown after close failed: {}", e);
        }

        debug!(peer_addr = %self.peer_addr, "Connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Recover the raw stream plus any bytes buffered past the last frame
    pub fn into_parts(self) -> Result<(TcpStream, Bytes), ConnectionError> {
        let state = self.reader.into_inner();
        let writer = self.writer.into_inner();
        let stream = state
            .half
            .reunite(writer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok((stream, state.buffer.freeze()))
    }
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::{AuthRequest, MessageKind, MAX_BODY_SIZE};
    use bytes::BufMut;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn raw_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    async fn pair() -> (ControlConnection, ControlConnection) {
        let (client, server) = raw_pair().await;
        (
            ControlConnection::new(client).unwrap(),
            ControlConnection::new(server).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (client, server) = pair().await;

        let auth = ControlMessage::Auth(AuthRequest {
            client_id: "agent-1".to_string(),
            token: "secret".to_string(),
            version: "1.0.0".to_string(),
        });
        client.send_message(&auth).await.unwrap();
        client.send(&Frame::empty(MessageKind::Ping)).await.unwrap();

        assert_eq!(server.recv_message().await.unwrap(), auth);
        assert_eq!(server.recv().await.unwrap().kind, MessageKind::Ping);
    }

    #[tokio::test]
    async fn test_read_deadline_is_distinct_and_retryable() {
        let (mut raw, server) = raw_pair().await;
        let server = ControlConnection::new(server).unwrap();

        // Half a frame arrives before the deadline
        let encoded = FrameCodec::encode_frame(&Frame::new(MessageKind::Pong, &b"{}"[..])).unwrap();
        raw.write_all(&encoded[..3]).await.unwrap();

        server.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
        let err = server.recv().await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);

        // The partial header is still buffered, so the retry sees a whole frame
        raw.write_all(&encoded[3..]).await.unwrap();
        server.set_read_deadline(None);
        let frame = server.recv().await.unwrap();
        assert_eq!(frame.kind, MessageKind::Pong);
        assert_eq!(&frame.body[..], b"{}");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unblocks_recv() {
        let (_client, server) = pair().await;
        let server = Arc::new(server);

        let pending = {
            let server = server.clone();
            tokio::spawn(async move { server.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.close().await.unwrap();
        server.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("recv should unblock after close")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert!(server.is_closed());
        assert!(matches!(
            server.send(&Frame::empty(MessageKind::Ping)).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_reaches_peer() {
        let (client, server) = pair().await;
        client.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), server.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut raw, server) = raw_pair().await;
        let server = ControlConnection::new(server).unwrap();

        let encoded =
            FrameCodec::encode_frame(&Frame::new(MessageKind::Auth, &b"{\"a\":1}"[..])).unwrap();
        raw.write_all(&encoded[..encoded.len() - 2]).await.unwrap();
        drop(raw);

        let result = server.recv().await;
        assert!(matches!(
            result,
            Err(ConnectionError::Codec(CodecError::Truncated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_from_header() {
        let (mut raw, server) = raw_pair().await;
        let server = ControlConnection::new(server).unwrap();

        let mut header = BytesMut::new();
        header.put_u8(MessageKind::RegisterTunnel.as_u8());
        header.put_u32((MAX_BODY_SIZE * 4) as u32);
        raw.write_all(&header).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), server.recv())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Codec(CodecError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_into_parts_keeps_buffered_bytes() {
        let (mut raw, server) = raw_pair().await;
        let server = ControlConnection::new(server).unwrap();

        let mut payload = BytesMut::new();
        let ready = Frame::new(MessageKind::DataChannelReady, &b"{\"proxy_id\":\"p1\"}"[..]);
        payload.extend_from_slice(&FrameCodec::encode_frame(&ready).unwrap());
        payload.extend_from_slice(b"hello");
        raw.write_all(&payload).await.unwrap();

        let frame = server.recv().await.unwrap();
        assert_eq!(frame.kind, MessageKind::DataChannelReady);

        let (mut stream, buffered) = server.into_parts().unwrap();

        // Whatever was not buffered yet is still readable from the stream
        let mut seen = buffered.to_vec();
        while seen.len() < 5 {
            let mut chunk = [0u8; 16];
            let n = stream.read(&mut chunk).await.unwrap();
            seen.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(seen, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = ControlConnection::connect(addr, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ConnectionError::Io(_))));
    }
}
