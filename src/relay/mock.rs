//! In-memory transport doubles for exercising rooms without sockets.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Bytes;

use super::transport::{Connection, PendingRequest};
use super::types::{ConnectionEvent, Frame, RelayError};

/// What the room did to a mock connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Bytes(Bytes),
    Close(u16),
}

pub(crate) enum Outcome {
    Accepted(MockRemote),
    Rejected { status: u16, reason: String },
}

pub(crate) struct MockRequest {
    subprotocol: String,
    terminated: watch::Receiver<bool>,
    outcome: oneshot::Sender<Outcome>,
    fail_accept: bool,
}

/// Test-side handle of a [`MockRequest`]
pub(crate) struct MockClient {
    terminate: watch::Sender<bool>,
    outcome: oneshot::Receiver<Outcome>,
}

pub(crate) fn request() -> (MockRequest, MockClient) {
    let (terminate_tx, terminate_rx) = watch::channel(false);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let request = MockRequest {
        subprotocol: "pairlink".to_string(),
        terminated: terminate_rx,
        outcome: outcome_tx,
        fail_accept: false,
    };
    let client = MockClient {
        terminate: terminate_tx,
        outcome: outcome_rx,
    };
    (request, client)
}

/// A request whose acceptance fails
pub(crate) fn failing_request() -> (MockRequest, MockClient) {
    let (mut request, client) = request();
    request.fail_accept = true;
    (request, client)
}

impl MockClient {
    /// Simulate the client transport dropping before acceptance.
    pub fn terminate(&self) {
        self.terminate.send_replace(true);
    }

    pub async fn accepted(self) -> MockRemote {
        match self.outcome.await {
            Ok(Outcome::Accepted(remote)) => remote,
            Ok(Outcome::Rejected { status, reason }) => {
                panic!("expected acceptance, got rejection {} {}", status, reason)
            }
            Err(_) => panic!("request dropped without an answer"),
        }
    }

    pub async fn rejected(self) -> (u16, String) {
        match self.outcome.await {
            Ok(Outcome::Rejected { status, reason }) => (status, reason),
            Ok(Outcome::Accepted(_)) => panic!("expected rejection, got acceptance"),
            Err(_) => panic!("request dropped without an answer"),
        }
    }

    /// True while the request is still unanswered. An answer, if present,
    /// is consumed.
    pub fn is_pending(&mut self) -> bool {
        matches!(self.outcome.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

impl PendingRequest for MockRequest {
    type Connection = MockConnection;

    fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    fn origin(&self) -> Option<&str> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn accept(
        self,
        _subprotocol: String,
        _origin: Option<String>,
    ) -> Result<MockConnection, RelayError> {
        if self.fail_accept {
            return Err(RelayError::ConnectionClosed);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let remote = MockRemote {
            events: events_tx,
            sent: sent_rx,
        };
        let _ = self.outcome.send(Outcome::Accepted(remote));

        Ok(MockConnection {
            events: events_rx,
            sent: sent_tx,
        })
    }

    fn reject(self, status: u16, reason: String) -> impl Future<Output = ()> + Send + 'static {
        let outcome = self.outcome;
        async move {
            let _ = outcome.send(Outcome::Rejected { status, reason });
        }
    }

    async fn terminated(&mut self) {
        let signalled = self.terminated.wait_for(|terminated| *terminated).await.is_ok();
        if !signalled {
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) struct MockConnection {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    sent: mpsc::UnboundedSender<Sent>,
}

impl Connection for MockConnection {
    async fn send_bytes(&mut self, payload: Bytes) -> Result<(), RelayError> {
        self.sent
            .send(Sent::Bytes(payload))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    async fn close(&mut self, code: u16) -> Result<(), RelayError> {
        self.sent
            .send(Sent::Close(code))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    async fn next_event(&mut self) -> ConnectionEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => ConnectionEvent::Closed {
                code: 1006,
                reason: String::new(),
            },
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Test-side end of an accepted [`MockConnection`]
pub(crate) struct MockRemote {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    sent: mpsc::UnboundedReceiver<Sent>,
}

impl MockRemote {
    pub fn send_binary(&self, payload: &'static [u8]) {
        let _ = self
            .events
            .send(ConnectionEvent::Message(Frame::Binary(Bytes::from_static(payload))));
    }

    pub fn send_text(&self, text: &str) {
        let _ = self
            .events
            .send(ConnectionEvent::Message(Frame::Text(text.to_string())));
    }

    pub fn close(&self, code: u16) {
        let _ = self.events.send(ConnectionEvent::Closed {
            code,
            reason: String::new(),
        });
    }

    pub fn error(&self) {
        let _ = self
            .events
            .send(ConnectionEvent::Error(RelayError::ConnectionClosed));
    }

    /// Next thing the room did to this connection
    pub async fn next_sent(&mut self) -> Option<Sent> {
        self.sent.recv().await
    }

    /// Drain everything the room has done so far without waiting.
    pub fn drain_sent(&mut self) -> Vec<Sent> {
        let mut out = Vec::new();
        while let Ok(sent) = self.sent.try_recv() {
            out.push(sent);
        }
        out
    }
}
