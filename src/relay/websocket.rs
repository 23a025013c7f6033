//! WebSocket transport: upgrade requests held open until a room accepts them.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, create_response};
use tokio_tungstenite::tungstenite::http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, ORIGIN, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::http::{Response, Version};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Bytes, Message, Utf8Bytes};
use tracing::debug;

use crate::config::KeepaliveConfig;

use super::transport::{Connection, PendingRequest};
use super::types::{ConnectionEvent, Frame, Rejection, RelayError, RoomId};

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 1024;

const REJECT_REASON: &str = "X-WebSocket-Reject-Reason";

/// Close code reported when the peer vanished without a close frame
const CLOSE_ABNORMAL: u16 = 1006;
/// Close code reported for a close frame without a status
const CLOSE_NO_STATUS: u16 = 1005;

/// Parse a complete request head out of `buf`. `Ok(None)` means more bytes
/// are needed; otherwise the head length is returned with the request.
fn parse_head(buf: &[u8]) -> Result<Option<(Request, usize)>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(RelayError::RequestTooLarge),
        Err(e) => return Err(RelayError::Malformed(e.to_string())),
    };

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or_default())
        .uri(parsed.path.unwrap_or_default())
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder
        .body(())
        .map_err(|e| RelayError::Malformed(e.to_string()))?;

    Ok(Some((request, len)))
}

/// Read a request head without answering it. Bytes read past the head are
/// returned alongside it.
async fn read_head(stream: &mut TcpStream) -> Result<(Request, Vec<u8>), RelayError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let room = MAX_HEAD_BYTES - buf.len();
        if room == 0 {
            return Err(RelayError::RequestTooLarge);
        }

        let n = stream.read(&mut chunk[..room.min(READ_CHUNK)]).await?;
        if n == 0 {
            return Err(RelayError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((request, len)) = parse_head(&buf)? {
            let rest = buf.split_off(len);
            return Ok((request, rest));
        }
    }
}

/// Sub-protocols a request offers, in order
fn offered_protocols(request: &Request) -> impl Iterator<Item = &str> {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Check the request is a WebSocket upgrade asking for `subprotocol` on a
/// room path, and return the room id.
pub fn validate_upgrade(request: &Request, subprotocol: &str) -> Result<RoomId, Rejection> {
    if let Err(e) = create_response(request) {
        debug!("Not a WebSocket upgrade: {}", e);
        return Err(Rejection::bad_request("Not A WebSocket Upgrade"));
    }

    if !offered_protocols(request).any(|p| p == subprotocol) {
        return Err(Rejection::invalid_subprotocol());
    }

    RoomId::from_path(request_path(request)).ok_or_else(Rejection::invalid_path)
}

/// Path as sent, query included
fn request_path(request: &Request) -> &str {
    request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
}

fn rejection_response(status: u16, reason: &str) -> Result<Response<String>, RelayError> {
    Response::builder()
        .status(status)
        .header(CONNECTION, "close")
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(REJECT_REASON, reason)
        .header(CONTENT_LENGTH, reason.len().to_string())
        .body(reason.to_string())
        .map_err(|e| RelayError::Malformed(e.to_string()))
}

/// Serialize a response status line and headers
fn encode_head<B>(response: &Response<B>) -> Vec<u8> {
    let mut out = format!("{:?} {}\r\n", response.version(), response.status()).into_bytes();
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// An upgrade request read off a TCP socket, not yet answered.
pub struct UpgradeRequest {
    socket: TcpStream,
    remote_addr: SocketAddr,
    request: Request,
    /// Bytes the client sent past the request head
    early: Vec<u8>,
    subprotocol: String,
    keepalive: KeepaliveConfig,
}

impl UpgradeRequest {
    pub async fn read(
        mut socket: TcpStream,
        remote_addr: SocketAddr,
        keepalive: KeepaliveConfig,
    ) -> Result<Self, RelayError> {
        let (request, early) = read_head(&mut socket).await?;
        let subprotocol = offered_protocols(&request)
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            socket,
            remote_addr,
            request,
            early,
            subprotocol,
            keepalive,
        })
    }

    pub fn path(&self) -> &str {
        request_path(&self.request)
    }

    /// Validate the request and select `subprotocol` for the eventual
    /// acceptance.
    pub fn validate(&mut self, subprotocol: &str) -> Result<RoomId, Rejection> {
        let room_id = validate_upgrade(&self.request, subprotocol)?;
        self.subprotocol = subprotocol.to_string();
        Ok(room_id)
    }
}

impl PendingRequest for UpgradeRequest {
    type Connection = WsConnection;

    fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    fn origin(&self) -> Option<&str> {
        self.request
            .headers()
            .get(ORIGIN)
            .and_then(|value| value.to_str().ok())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    async fn accept(
        mut self,
        subprotocol: String,
        origin: Option<String>,
    ) -> Result<WsConnection, RelayError> {
        let mut response = create_response(&self.request)?;
        if !subprotocol.is_empty() {
            let value = HeaderValue::from_str(&subprotocol)
                .map_err(|e| RelayError::Malformed(e.to_string()))?;
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        self.socket.write_all(&encode_head(&response)).await?;
        self.socket.flush().await?;
        debug!(
            "Accepted WebSocket from {} [protocol:{}, origin:{:?}]",
            self.remote_addr, subprotocol, origin
        );

        let ws =
            WebSocketStream::from_partially_read(self.socket, self.early, Role::Server, None).await;
        Ok(WsConnection::new(ws, self.remote_addr, self.keepalive))
    }

    fn reject(self, status: u16, reason: String) -> impl Future<Output = ()> + Send + 'static {
        let mut socket = self.socket;
        let remote_addr = self.remote_addr;

        async move {
            let response = match rejection_response(status, &reason) {
                Ok(response) => response,
                Err(e) => {
                    debug!("Failed to build rejection for {}: {}", remote_addr, e);
                    let _ = socket.shutdown().await;
                    return;
                }
            };

            let mut bytes = encode_head(&response);
            bytes.extend_from_slice(response.body().as_bytes());
            if let Err(e) = socket.write_all(&bytes).await {
                debug!("Failed to send rejection to {}: {}", remote_addr, e);
                return;
            }
            let _ = socket.shutdown().await;
        }
    }

    async fn terminated(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) if self.early.len() + n > MAX_HEAD_BYTES => {
                    debug!("{} sent too much before the handshake finished", self.remote_addr);
                    return;
                }
                // Kept for the WebSocket stream once accepted.
                Ok(n) => self.early.extend_from_slice(&chunk[..n]),
            }
        }
    }
}

/// An accepted WebSocket with ping/pong keepalive
pub struct WsConnection {
    ws: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    ping_interval: Interval,
    pong_timeout: std::time::Duration,
    pong_deadline: Option<Instant>,
}

impl WsConnection {
    fn new(ws: WebSocketStream<TcpStream>, remote_addr: SocketAddr, keepalive: KeepaliveConfig) -> Self {
        let mut ping_interval = interval_at(Instant::now() + keepalive.interval, keepalive.interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            ws,
            remote_addr,
            ping_interval,
            pong_timeout: keepalive.pong_timeout,
            pong_deadline: None,
        }
    }
}

impl Connection for WsConnection {
    async fn send_bytes(&mut self, payload: Bytes) -> Result<(), RelayError> {
        self.ws.send(Message::Binary(payload)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<(), RelayError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from_static(""),
        };
        self.ws.close(Some(frame)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            let waiting_for_pong = self.pong_deadline.is_some();
            let pong_deadline = self.pong_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = self.ping_interval.tick() => {
                    if waiting_for_pong {
                        continue;
                    }
                    if let Err(e) = self.ws.send(Message::Ping(Bytes::new())).await {
                        return ConnectionEvent::Error(e.into());
                    }
                    self.pong_deadline = Some(Instant::now() + self.pong_timeout);
                    debug!("Ping sent to {}", self.remote_addr);
                }

                _ = sleep_until(pong_deadline), if waiting_for_pong => {
                    return ConnectionEvent::Error(RelayError::KeepaliveTimeout);
                }

                msg = self.ws.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                        | None => {
                            return ConnectionEvent::Closed {
                                code: CLOSE_ABNORMAL,
                                reason: String::new(),
                            };
                        }
                        Some(Err(e)) => return ConnectionEvent::Error(e.into()),
                    };

                    match msg {
                        Message::Binary(payload) => return ConnectionEvent::Message(Frame::Binary(payload)),
                        Message::Text(text) => {
                            return ConnectionEvent::Message(Frame::Text(text.as_str().to_owned()));
                        }
                        Message::Close(frame) => {
                            let (code, reason) = match frame {
                                Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                                None => (CLOSE_NO_STATUS, String::new()),
                            };
                            return ConnectionEvent::Closed { code, reason };
                        }
                        Message::Pong(_) => {
                            self.pong_deadline = None;
                            debug!("Pong received from {}", self.remote_addr);
                        }
                        // Pings are answered by tungstenite itself.
                        Message::Ping(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }
}
