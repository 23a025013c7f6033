//! Runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::Cli;

pub const DEFAULT_RELAY_PORT: u16 = 8088;
pub const DEFAULT_PEER_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_SUBPROTOCOL: &str = "pairlink";

/// Settings consumed by each room.
#[derive(Debug, Clone, Copy)]
pub struct RoomConfig {
    /// How long the first peer waits for the second one.
    pub peer_wait: Duration,
    /// Upper bound on each connection close during teardown.
    pub close_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            peer_wait: DEFAULT_PEER_WAIT,
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Settings of an accepted WebSocket connection.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub subprotocol: String,
    pub handshake_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    pub room: RoomConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
            handshake_timeout: Duration::from_secs(10),
            keepalive: KeepaliveConfig::default(),
            room: RoomConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            listen: cli.listen,
            subprotocol: cli.subprotocol.clone(),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout),
            keepalive: KeepaliveConfig {
                interval: Duration::from_secs(cli.keepalive_interval),
                pong_timeout: Duration::from_secs(cli.pong_timeout),
            },
            room: RoomConfig {
                peer_wait: Duration::from_secs(cli.peer_wait),
                close_timeout: Duration::from_secs(cli.close_timeout),
            },
        }
    }
}
