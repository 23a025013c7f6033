//! Room pairing and binary relay between two WebSocket peers

mod actor;
#[cfg(test)]
mod mock;
mod room;
mod transport;
mod types;
mod websocket;

pub use actor::RoomRegistryHandle;
pub use transport::{Connection, PendingRequest};
pub use types::{
    CLOSE_NORMAL, ConnectionEvent, Frame, PeerStatus, Rejection, RelayError, RoomId, RoomPhase,
    RoomSnapshot, Slot,
};
pub use websocket::{UpgradeRequest, WsConnection, validate_upgrade};
