//! A control connection handed over to a forwarding pair mid-stream

use burrow_connection::{ControlConnection, ForwardingPair};
use burrow_proto::{ControlMessage, DataChannelReady, FrameCodec};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), server.unwrap().0)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bytes_behind_ready_frame_reach_local_leg() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (mut agent_side, broker_side) = tcp_pair().await;
    let (mut user, local) = tcp_pair().await;

    // The readiness frame and the first user bytes land in one segment
    let ready = ControlMessage::DataChannelReady(DataChannelReady {
        proxy_id: "p-1".to_string(),
    });
    let mut segment = FrameCodec::encode_frame(&ready.to_frame().unwrap())
        .unwrap()
        .to_vec();
    segment.extend_from_slice(b"early bytes");
    agent_side.write_all(&segment).await.unwrap();

    let connection = ControlConnection::new(broker_side).unwrap();
    let message = connection.recv_message().await.unwrap();
    assert_eq!(message, ready);

    let (channel, buffered) = connection.into_parts().unwrap();
    let pair = ForwardingPair::new("p-1", local, channel)
        .with_buffered(buffered)
        .with_half_close_grace(Duration::from_secs(1));
    let forwarding = tokio::spawn(pair.run(CancellationToken::new()));

    agent_side.write_all(b", late bytes").await.unwrap();
    agent_side.shutdown().await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"early bytes, late bytes");

    drop(user);
    let stats = tokio::time::timeout(Duration::from_secs(5), forwarding)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.channel_to_local, received.len() as u64);
    assert_eq!(stats.local_to_channel, 0);
}
