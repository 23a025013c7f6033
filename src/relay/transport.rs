//! Contracts between the room core and the transport layer that feeds it.

use std::future::Future;
use std::net::SocketAddr;

use tokio_tungstenite::tungstenite::Bytes;

use super::types::{ConnectionEvent, RelayError};

/// An accepted, live bidirectional connection.
pub trait Connection: Send + 'static {
    /// Send a binary payload to the remote side.
    fn send_bytes(&mut self, payload: Bytes) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Start a close handshake with the given close code.
    fn close(&mut self, code: u16) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Wait for the next event. Must be cancel-safe: the room drops this
    /// future whenever another event source wins the race.
    fn next_event(&mut self) -> impl Future<Output = ConnectionEvent> + Send;

    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// A validated upgrade request whose handshake has not been answered yet.
pub trait PendingRequest: Send + 'static {
    type Connection: Connection;

    /// First sub-protocol requested by the client
    fn subprotocol(&self) -> &str;

    fn origin(&self) -> Option<&str>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Complete the handshake and hand back the live connection.
    fn accept(
        self,
        subprotocol: String,
        origin: Option<String>,
    ) -> impl Future<Output = Result<Self::Connection, RelayError>> + Send;

    /// Fail the handshake. Best-effort; the returned future is detached from
    /// the request so it can be spawned.
    fn reject(self, status: u16, reason: String) -> impl Future<Output = ()> + Send + 'static;

    /// Resolves once the client transport ends before acceptance.
    /// Must be cancel-safe.
    fn terminated(&mut self) -> impl Future<Output = ()> + Send;
}
