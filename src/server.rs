use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::relay::{PendingRequest, RelayError, RoomRegistryHandle, UpgradeRequest};

pub struct RelayServer {
    listener: TcpListener,
    config: Arc<RelayConfig>,
    registry: RoomRegistryHandle<UpgradeRequest>,
}

impl RelayServer {
    /// Bind the listener and start the room registry.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let registry = RoomRegistryHandle::spawn(config.room);

        info!("Relay server listening on {}", listener.local_addr()?);
        info!(
            "Sub-protocol \"{}\", peer wait {:?}",
            config.subprotocol, config.room.peer_wait
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
            registry,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> RoomRegistryHandle<UpgradeRequest> {
        self.registry.clone()
    }

    /// Serve forever.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Rooms already running are left to
    /// finish on their own.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> std::io::Result<()> {
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Relay server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let config = self.config.clone();
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, config, registry).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<RelayConfig>,
    registry: RoomRegistryHandle<UpgradeRequest>,
) -> Result<(), RelayError> {
    let mut request = timeout(
        config.handshake_timeout,
        UpgradeRequest::read(stream, addr, config.keepalive),
    )
    .await
    .map_err(|_| RelayError::HandshakeTimeout)??;

    debug!(
        "Upgrade request [path:{} | origin:{:?} | ip:{}]",
        request.path(),
        request.origin(),
        addr
    );

    match request.validate(&config.subprotocol) {
        Ok(room_id) => registry.route(room_id, request),
        Err(rejection) => {
            warn!(
                "Rejecting request from {} for {}: {}",
                addr,
                request.path(),
                rejection
            );
            request.reject(rejection.status, rejection.reason).await;
            Ok(())
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C");
    }
}
