use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Bytes};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("request head too large")]
    RequestTooLarge,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("no pong received within the keepalive window")]
    KeepaliveTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_INTERNAL: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// WebSocket "normal closure" close code
pub const CLOSE_NORMAL: u16 = 1000;

/// HTTP-level refusal of a pending upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {reason}")]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(STATUS_BAD_REQUEST, reason)
    }

    pub fn invalid_subprotocol() -> Self {
        Self::new(STATUS_INTERNAL, "Invalid WebSocket Sub-Protocol")
    }

    pub fn invalid_path() -> Self {
        Self::new(STATUS_INTERNAL, "Invalid Path")
    }

    pub fn room_full() -> Self {
        Self::new(STATUS_FORBIDDEN, "Room Full")
    }

    pub fn room_closed() -> Self {
        Self::new(STATUS_UNAVAILABLE, "Room Closed")
    }
}

const ROOM_ID_MIN_LEN: usize = 6;
const ROOM_ID_MAX_LEN: usize = 20;

/// Room identifier: 6-20 ASCII alphanumerics stored inline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId {
    bytes: [u8; ROOM_ID_MAX_LEN],
    len: u8,
}

impl RoomId {
    /// Extract the room id from a request path of the form `/<anything>/<id>`.
    pub fn from_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix('/')?;
        let (_, id) = rest.rsplit_once('/')?;
        Self::try_from(id).ok()
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RoomId {
    type Error = Rejection;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let src = s.as_bytes();
        if !(ROOM_ID_MIN_LEN..=ROOM_ID_MAX_LEN).contains(&src.len())
            || !src.iter().all(u8::is_ascii_alphanumeric)
        {
            return Err(Rejection::invalid_path());
        }

        let mut bytes = [0u8; ROOM_ID_MAX_LEN];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            bytes,
            len: src.len() as u8,
        })
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Which of the two peer slots of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    /// The paired slot
    pub fn other(self) -> Self {
        match self {
            Slot::First => Slot::Second,
            Slot::Second => Slot::First,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::First => f.write_str("peerA"),
            Slot::Second => f.write_str("peerB"),
        }
    }
}

/// Application payload delivered by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
}

/// Events delivered by an accepted connection
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(Frame),
    Closed { code: u16, reason: String },
    Error(RelayError),
}

/// Lifecycle phase of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Empty,
    WaitingForSecond,
    Paired,
    Closed,
}

/// Per-slot status used in room state dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Missing,
    Waiting,
    Pending,
    Connected,
    Disconnected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Missing => "missing",
            PeerStatus::Waiting => "waiting",
            PeerStatus::Pending => "pending",
            PeerStatus::Connected => "connected",
            PeerStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub phase: RoomPhase,
}
