use std::fmt::Write as _;
use std::mem;

use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::config::RoomConfig;

use super::transport::{Connection, PendingRequest};
use super::types::{
    CLOSE_NORMAL, ConnectionEvent, Frame, PeerStatus, Rejection, RelayError, RoomId, RoomPhase,
    Slot,
};

/// Leading messages per peer that get a hex preview in the debug log
const LOGGED_MESSAGES: usize = 5;
const PREVIEW_BYTES: usize = 10;

/// Closure notification, invoked exactly once
pub(crate) type OnClose = Box<dyn FnOnce() + Send>;

/// Everything that can happen to a room, processed one at a time
enum RoomEvent<R> {
    PeerJoined(R),
    RequestsClosed,
    TimeoutFired,
    PeerTerminated(Slot),
    MessageReceived(Slot, Frame),
    PeerClosed {
        slot: Slot,
        code: u16,
        reason: String,
    },
    PeerErrored(Slot, RelayError),
}

enum PeerState<R: PendingRequest> {
    Pending(R),
    Open(R::Connection),
    Disconnected,
}

struct Peer<R: PendingRequest> {
    slot: Slot,
    state: PeerState<R>,
    /// Set once both slots are filled; always `slot.other()`
    paired_with: Option<Slot>,
    messages: usize,
}

impl<R: PendingRequest> Peer<R> {
    fn new(slot: Slot, request: R) -> Self {
        Self {
            slot,
            state: PeerState::Pending(request),
            paired_with: None,
            messages: 0,
        }
    }

    fn status(&self) -> PeerStatus {
        match (&self.state, self.slot) {
            (PeerState::Pending(_), Slot::First) => PeerStatus::Waiting,
            (PeerState::Pending(_), Slot::Second) => PeerStatus::Pending,
            (PeerState::Open(_), _) => PeerStatus::Connected,
            (PeerState::Disconnected, _) => PeerStatus::Disconnected,
        }
    }

    fn is_watched(&self) -> bool {
        !matches!(self.state, PeerState::Disconnected)
    }

    /// Best-effort teardown: close an open connection or refuse a request
    /// that was never accepted. Failures are logged and dropped.
    async fn shutdown(self, room: RoomId, close_timeout: std::time::Duration) {
        match self.state {
            PeerState::Open(mut connection) => {
                match timeout(close_timeout, connection.close(CLOSE_NORMAL)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(room = %room, "ignoring close error on {}: {}", self.slot, e),
                    Err(_) => debug!(room = %room, "close of {} timed out", self.slot),
                }
            }
            PeerState::Pending(request) => {
                let rejection = Rejection::room_closed();
                let reject = request.reject(rejection.status, rejection.reason);
                if timeout(close_timeout, reject).await.is_err() {
                    debug!(room = %room, "rejection of {} timed out", self.slot);
                }
            }
            PeerState::Disconnected => {}
        }
    }
}

/// What a peer slot produced while the room was waiting on it
enum PeerSignal {
    Terminated,
    Event(ConnectionEvent),
}

async fn peer_signal<R: PendingRequest>(peer: &mut Option<Peer<R>>) -> PeerSignal {
    match peer.as_mut().map(|p| &mut p.state) {
        Some(PeerState::Pending(request)) => {
            request.terminated().await;
            PeerSignal::Terminated
        }
        Some(PeerState::Open(connection)) => PeerSignal::Event(connection.next_event().await),
        _ => std::future::pending().await,
    }
}

fn into_room_event<R>(slot: Slot, signal: PeerSignal) -> RoomEvent<R> {
    match signal {
        PeerSignal::Terminated => RoomEvent::PeerTerminated(slot),
        PeerSignal::Event(ConnectionEvent::Message(frame)) => RoomEvent::MessageReceived(slot, frame),
        PeerSignal::Event(ConnectionEvent::Closed { code, reason }) => {
            RoomEvent::PeerClosed { slot, code, reason }
        }
        PeerSignal::Event(ConnectionEvent::Error(e)) => RoomEvent::PeerErrored(slot, e),
    }
}

fn hex_preview(payload: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_BYTES * 2 + 3);
    for byte in payload.iter().take(PREVIEW_BYTES) {
        let _ = write!(out, "{:02x}", byte);
    }
    if payload.len() > PREVIEW_BYTES {
        out.push_str("...");
    }
    out
}

/// Registry-side link to a running room
pub(crate) struct RoomLink<R> {
    pub requests: mpsc::UnboundedSender<R>,
    pub phase: watch::Receiver<RoomPhase>,
}

/// Pairing state machine and relay for a single room id.
///
/// The room runs as its own task. Join requests arrive on a channel; the
/// pairing deadline, the first peer's early disconnect and both connections'
/// events are multiplexed into [`RoomEvent`]s and handled strictly in order,
/// so every transition sees the current `closed` flag.
pub(crate) struct Room<R: PendingRequest> {
    id: RoomId,
    config: RoomConfig,
    requests: mpsc::UnboundedReceiver<R>,
    requests_open: bool,
    peer_a: Option<Peer<R>>,
    peer_b: Option<Peer<R>>,
    pair_deadline: Option<Instant>,
    closed: bool,
    phase: watch::Sender<RoomPhase>,
    on_close: Option<OnClose>,
}

impl<R: PendingRequest> Room<R> {
    pub(crate) fn new(id: RoomId, config: RoomConfig, on_close: OnClose) -> (Self, RoomLink<R>) {
        debug!(room = %id, "new room [peer_wait:{:?}]", config.peer_wait);

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(RoomPhase::Empty);

        let room = Self {
            id,
            config,
            requests: requests_rx,
            requests_open: true,
            peer_a: None,
            peer_b: None,
            pair_deadline: None,
            closed: false,
            phase: phase_tx,
            on_close: Some(on_close),
        };
        let link = RoomLink {
            requests: requests_tx,
            phase: phase_rx,
        };
        (room, link)
    }

    pub(crate) async fn run(mut self) {
        while !self.closed {
            let Some(event) = self.next_event().await else {
                break;
            };
            self.handle(event).await;
        }
        debug!(room = %self.id, "room task finished");
    }

    async fn next_event(&mut self) -> Option<RoomEvent<R>> {
        let requests_open = self.requests_open;
        let timer_armed = self.pair_deadline.is_some();
        let deadline = self.pair_deadline.unwrap_or_else(Instant::now);
        let watch_a = self.peer_a.as_ref().is_some_and(Peer::is_watched);
        let watch_b = self.peer_b.as_ref().is_some_and(Peer::is_watched);

        let event = tokio::select! {
            request = self.requests.recv(), if requests_open => match request {
                Some(request) => RoomEvent::PeerJoined(request),
                None => RoomEvent::RequestsClosed,
            },
            _ = sleep_until(deadline), if timer_armed => RoomEvent::TimeoutFired,
            signal = peer_signal(&mut self.peer_a), if watch_a => into_room_event(Slot::First, signal),
            signal = peer_signal(&mut self.peer_b), if watch_b => into_room_event(Slot::Second, signal),
            else => return None,
        };
        Some(event)
    }

    async fn handle(&mut self, event: RoomEvent<R>) {
        if self.closed {
            return;
        }

        match event {
            RoomEvent::PeerJoined(request) => self.handle_request(request).await,
            RoomEvent::RequestsClosed => {
                debug!(room = %self.id, "registry gone, no further requests");
                self.requests_open = false;
            }
            RoomEvent::TimeoutFired => {
                warn!(
                    room = %self.id,
                    "peerA gave up after {:?} waiting for peerB to join", self.config.peer_wait
                );
                self.close_room().await;
            }
            RoomEvent::PeerTerminated(slot) => self.on_peer_terminated(slot).await,
            RoomEvent::MessageReceived(slot, frame) => self.relay(slot, frame).await,
            RoomEvent::PeerClosed { slot, code, reason } => {
                info!(room = %self.id, "socket closed by {} [code:{}, reason:\"{}\"]", slot, code, reason);
                self.mark_disconnected(slot);
                self.close_room().await;
            }
            RoomEvent::PeerErrored(slot, e) => {
                warn!(room = %self.id, "socket error in {}: {}", slot, e);
                self.mark_disconnected(slot);
                self.close_room().await;
            }
        }
    }

    /// Place a request into the first free slot, or refuse it if the room is full.
    async fn handle_request(&mut self, request: R) {
        debug!(room = %self.id, "handle request [remote:{:?}]", request.remote_addr());

        if self.peer_a.is_none() {
            info!(room = %self.id, "peerA joined, waiting for peerB");
            self.peer_a = Some(Peer::new(Slot::First, request));
            self.pair_deadline = Some(Instant::now() + self.config.peer_wait);
            self.set_phase(RoomPhase::WaitingForSecond);
            return;
        }

        if self.peer_b.is_some() {
            warn!(room = %self.id, "room already full, rejecting request");
            let rejection = Rejection::room_full();
            tokio::spawn(request.reject(rejection.status, rejection.reason));
            return;
        }

        info!(room = %self.id, "peerB joined, accepting connections from both peers");
        self.peer_b = Some(Peer::new(Slot::Second, request));
        for slot in [Slot::First, Slot::Second] {
            if let Some(peer) = self.peer_mut(slot) {
                peer.paired_with = Some(slot.other());
            }
        }
        self.accept_connections().await;
    }

    async fn accept_connections(&mut self) {
        self.pair_deadline = None;

        for slot in [Slot::First, Slot::Second] {
            if let Err(e) = self.accept(slot).await {
                warn!(room = %self.id, "failed to accept connection of {}: {}", slot, e);
                self.close_room().await;
                return;
            }
        }

        let remote = |peer: &Option<Peer<R>>| match peer.as_ref().map(|p| &p.state) {
            Some(PeerState::Open(connection)) => connection.remote_addr(),
            _ => None,
        };
        info!(
            room = %self.id,
            "room ready [peerA:{:?} | peerB:{:?}]", remote(&self.peer_a), remote(&self.peer_b)
        );
        self.set_phase(RoomPhase::Paired);
    }

    async fn accept(&mut self, slot: Slot) -> Result<(), RelayError> {
        let Some(peer) = self.peer_mut(slot) else {
            return Err(RelayError::ConnectionClosed);
        };
        let PeerState::Pending(request) = mem::replace(&mut peer.state, PeerState::Disconnected)
        else {
            return Err(RelayError::ConnectionClosed);
        };

        let subprotocol = request.subprotocol().to_owned();
        let origin = request.origin().map(str::to_owned);
        let connection = request.accept(subprotocol, origin).await?;
        peer.state = PeerState::Open(connection);
        Ok(())
    }

    async fn on_peer_terminated(&mut self, slot: Slot) {
        // Once paired the connection events own the teardown.
        let Some(peer) = self.peer_mut(slot) else {
            return;
        };
        if peer.paired_with.is_some() {
            return;
        }

        peer.state = PeerState::Disconnected;
        info!(room = %self.id, "{} disconnected before peerB joined", slot);
        self.close_room().await;
    }

    async fn relay(&mut self, from: Slot, frame: Frame) {
        let id = self.id;
        let Some(peer) = self.peer_mut(from) else {
            return;
        };

        let payload = match frame {
            Frame::Binary(payload) => payload,
            Frame::Text(_) => {
                warn!(room = %id, "ignoring non binary message from {}", from);
                return;
            }
        };

        peer.messages += 1;
        if peer.messages <= LOGGED_MESSAGES {
            debug!(room = %id, "message #{} from {}: {}", peer.messages, from, hex_preview(&payload));
        }

        let Some(to) = peer.paired_with else {
            return;
        };
        let Some(PeerState::Open(connection)) = self.peer_mut(to).map(|p| &mut p.state) else {
            return;
        };

        let sent = connection.send_bytes(payload).await;
        if let Err(e) = sent {
            warn!(room = %id, "failed to forward message to {}: {}", to, e);
            self.mark_disconnected(to);
            self.close_room().await;
        }
    }

    /// Tear the room down. Idempotent.
    async fn close_room(&mut self) {
        if self.closed {
            return;
        }
        debug!(room = %self.id, "closing room");

        self.pair_deadline = None;
        self.closed = true;
        self.requests.close();
        self.set_phase(RoomPhase::Closed);
        self.dump();

        if let Some(notify) = self.on_close.take() {
            notify();
        }

        let id = self.id;
        let close_timeout = self.config.close_timeout;
        let peers = [self.peer_a.take(), self.peer_b.take()];
        join_all(
            peers
                .into_iter()
                .flatten()
                .map(|peer| peer.shutdown(id, close_timeout)),
        )
        .await;

        // Requests queued before the channel closed never reached a slot.
        while let Ok(request) = self.requests.try_recv() {
            debug!(room = %self.id, "refusing request queued on a closed room");
            let rejection = Rejection::room_closed();
            tokio::spawn(request.reject(rejection.status, rejection.reason));
        }

        info!(room = %self.id, "room closed");
    }

    fn mark_disconnected(&mut self, slot: Slot) {
        if let Some(peer) = self.peer_mut(slot) {
            peer.state = PeerState::Disconnected;
        }
    }

    fn peer_mut(&mut self, slot: Slot) -> Option<&mut Peer<R>> {
        match slot {
            Slot::First => self.peer_a.as_mut(),
            Slot::Second => self.peer_b.as_mut(),
        }
    }

    fn set_phase(&self, phase: RoomPhase) {
        self.phase.send_replace(phase);
    }

    fn dump(&self) {
        let status = |peer: &Option<Peer<R>>| peer.as_ref().map_or(PeerStatus::Missing, Peer::status);
        debug!(
            room = %self.id,
            "dump: [peerA:{} | peerB:{}]", status(&self.peer_a), status(&self.peer_b)
        );
    }
}
