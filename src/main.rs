use pairlink::cli::Cli;
use pairlink::config::RelayConfig;
use pairlink::server::{RelayServer, shutdown_signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse_args();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = RelayConfig::from_cli(&cli);

    println!("   Pairlink Relay Server");
    println!("   Binding to {}", config.listen);
    println!("   Press Ctrl+C to stop\n");

    let server = RelayServer::bind(config).await?;
    let registry = server.registry();
    server.run_until(shutdown_signal()).await?;

    match registry.snapshot().await {
        Ok(rooms) if rooms.is_empty() => info!("No rooms open at shutdown"),
        Ok(rooms) => match serde_json::to_string(&rooms) {
            Ok(json) => info!(count = rooms.len(), "Rooms open at shutdown: {}", json),
            Err(e) => warn!("Failed to serialize room snapshot: {}", e),
        },
        Err(e) => warn!("Failed to read room snapshot: {}", e),
    }

    Ok(())
}
