//! End-to-end tests over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pairlink::config::{KeepaliveConfig, RelayConfig, RoomConfig};
use pairlink::relay::{RoomId, RoomRegistryHandle, UpgradeRequest};
use pairlink::server::RelayServer;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config(peer_wait: Duration) -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        room: RoomConfig {
            peer_wait,
            ..RoomConfig::default()
        },
        ..RelayConfig::default()
    }
}

async fn start(peer_wait: Duration) -> (SocketAddr, RoomRegistryHandle<UpgradeRequest>) {
    start_with(config(peer_wait)).await
}

async fn start_with(config: RelayConfig) -> (SocketAddr, RoomRegistryHandle<UpgradeRequest>) {
    let server = RelayServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.run());
    (addr, registry)
}

async fn connect(addr: SocketAddr, path: &str, protocol: &'static str) -> Result<Client, tungstenite::Error> {
    let mut request = format!("ws://{}{}", addr, path).into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
    let (ws, _response) = connect_async(request).await?;
    Ok(ws)
}

fn rejected_status(result: Result<Client, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("expected the handshake to be rejected"),
    }
}

/// Connect two peers to the same room; the first waits in the background.
async fn pair(addr: SocketAddr, room: &str) -> (Client, Client) {
    let path = format!("/pairlink/{}", room);
    let first_path = path.clone();
    let first = tokio::spawn(async move { connect(addr, &first_path, "pairlink").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = connect(addr, &path, "pairlink").await.unwrap();
    let first = first.await.unwrap().unwrap();
    (first, second)
}

async fn wait_until_evicted(registry: &RoomRegistryHandle<UpgradeRequest>, room: &str) {
    let room_id = RoomId::try_from(room).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.contains(room_id).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room was not evicted");
}

#[tokio::test]
async fn pairs_and_relays_binary_only() {
    let (addr, registry) = start(Duration::from_secs(30)).await;
    let (mut peer_a, mut peer_b) = pair(addr, "room42").await;

    assert!(registry.contains(RoomId::try_from("room42").unwrap()).await.unwrap());

    peer_a
        .send(Message::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])))
        .await
        .unwrap();
    let received = peer_b.next().await.unwrap().unwrap();
    assert_eq!(received, Message::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])));

    peer_b.send(Message::text("not relayed")).await.unwrap();
    peer_b
        .send(Message::Binary(Bytes::from_static(b"relayed")))
        .await
        .unwrap();
    let received = peer_a.next().await.unwrap().unwrap();
    assert_eq!(received, Message::Binary(Bytes::from_static(b"relayed")));
}

#[tokio::test]
async fn third_peer_is_rejected() {
    let (addr, _registry) = start(Duration::from_secs(30)).await;
    let (mut peer_a, mut peer_b) = pair(addr, "abc123").await;

    let status = rejected_status(connect(addr, "/pairlink/abc123", "pairlink").await);
    assert_eq!(status, 403);

    peer_a
        .send(Message::Binary(Bytes::from_static(b"pair intact")))
        .await
        .unwrap();
    let received = peer_b.next().await.unwrap().unwrap();
    assert_eq!(received, Message::Binary(Bytes::from_static(b"pair intact")));
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let (addr, registry) = start(Duration::from_secs(30)).await;

    let status = rejected_status(connect(addr, "/pairlink/abc123", "chat").await);
    assert_eq!(status, 500);

    let status = rejected_status(connect(addr, "/abc123", "pairlink").await);
    assert_eq!(status, 500);

    let status = rejected_status(connect(addr, "/pairlink/no-dashes", "pairlink").await);
    assert_eq!(status, 500);

    assert_eq!(registry.room_count().await.unwrap(), 0);
}

#[tokio::test]
async fn lone_peer_times_out() {
    let (addr, registry) = start(Duration::from_secs(1)).await;

    let status = rejected_status(connect(addr, "/pairlink/abc123", "pairlink").await);
    assert_eq!(status, 503);

    wait_until_evicted(&registry, "abc123").await;
}

#[tokio::test]
async fn close_from_one_peer_closes_the_other() {
    let (addr, registry) = start(Duration::from_secs(30)).await;
    let (mut peer_a, mut peer_b) = pair(addr, "room42").await;

    peer_a.close(None).await.unwrap();

    let received = peer_b.next().await.unwrap().unwrap();
    match received {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected a close frame, got {:?}", other),
    }

    wait_until_evicted(&registry, "room42").await;

    // The id is free for a new pair.
    let (mut peer_c, mut peer_d) = pair(addr, "room42").await;
    peer_d
        .send(Message::Binary(Bytes::from_static(b"fresh room")))
        .await
        .unwrap();
    let received = peer_c.next().await.unwrap().unwrap();
    assert_eq!(received, Message::Binary(Bytes::from_static(b"fresh room")));
}

#[tokio::test]
async fn first_peer_leaving_early_frees_the_room() {
    let (addr, registry) = start(Duration::from_secs(30)).await;
    let room_id = RoomId::try_from("abc123").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /pairlink/abc123 HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Protocol: pairlink\r\n\
              \r\n",
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.contains(room_id).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room was not created");

    drop(stream);
    wait_until_evicted(&registry, "abc123").await;
}

#[tokio::test]
async fn missed_pong_closes_the_room() {
    let (addr, registry) = start_with(RelayConfig {
        keepalive: KeepaliveConfig {
            interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(200),
        },
        ..config(Duration::from_secs(30))
    })
    .await;
    // Never polled, so never answers a ping.
    let (silent_peer, mut peer_b) = pair(addr, "room42").await;

    let mut pinged = false;
    let close = loop {
        match peer_b.next().await.unwrap().unwrap() {
            Message::Ping(_) => pinged = true,
            Message::Close(frame) => break frame,
            other => panic!("unexpected message: {:?}", other),
        }
    };
    assert!(pinged);
    assert_eq!(close.map(|frame| frame.code), Some(CloseCode::Normal));

    wait_until_evicted(&registry, "room42").await;
    drop(silent_peer);
}
