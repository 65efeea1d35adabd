//! Aegis relay: the central sync server.
//!
//! Listens on `PORT` (default 1234), keeps one document per room and, when
//! `AEGIS_STORAGE_PATH` is set, persists every room to RocksDB.

use log::info;

use aegis_core::YrsReplica;
use aegis_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!("Starting Aegis relay on {}", config.bind_addr);

    let server = SyncServer::<YrsReplica>::new(config)?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    let stats = server.stats().await;
    info!(
        "Stopped: {} documents, {} rooms, {} connections served",
        stats.documents, stats.broadcast.rooms, stats.total_connections
    );

    Ok(())
}
