//! VectorDB Doctor
//!
//! Loads the configuration, connects to the vector store, prints service
//! statistics and health, and replays any offline queue left by the
//! application.

use anyhow::Context;
use organizer_vectordb::{observability::init_observability, service::VectorDbService, Config};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match std::env::var("CONFIG_PATH") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => Config::from_env().context("loading configuration from environment")?,
    };

    init_observability(&config.logging.level, &config.logging.format);
    info!("Checking vector store at {}", config.server.base_url());

    let service = VectorDbService::connect(config).await?;

    match service.initialize().await {
        Ok(()) => info!("Vector store initialized"),
        Err(e) => warn!("Initialization failed: {}", e),
    }

    let health = service.check_health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);

    if !service.offline_queue().is_empty() && service.is_ready() {
        let result = service.flush_offline_queue().await?;
        info!(
            "Replayed offline queue: {} processed, {} failed, {} remaining",
            result.processed, result.failed, result.remaining
        );
    }

    let stats = service.get_stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    service.shutdown().await?;
    Ok(())
}
