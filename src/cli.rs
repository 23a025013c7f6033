//! Command-line argument parsing.

use std::net::SocketAddr;

use clap::Parser;

/// Pairing relay for two WebSocket peers sharing a room id.
#[derive(Parser, Debug, Clone)]
#[command(name = "pairlink")]
#[command(about = "Pairs two WebSocket peers by room id and relays binary frames between them")]
#[command(version)]
pub struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8088")]
    pub listen: SocketAddr,

    /// Seconds the first peer waits for the second before the room closes.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub peer_wait: u64,

    /// WebSocket sub-protocol clients must request.
    #[arg(long, default_value = "pairlink")]
    pub subprotocol: String,

    /// Seconds allowed for a client to send its upgrade request.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub handshake_timeout: u64,

    /// Seconds allowed for each connection close handshake.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    pub close_timeout: u64,

    /// Seconds between keepalive pings on paired connections.
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..))]
    pub keepalive_interval: u64,

    /// Seconds to wait for a pong before dropping a connection.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub pong_timeout: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
