// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use clap::Parser;
use journeycast::config::AppConfig;
use journeycast::events::EventBus;
use journeycast::journey_store::JourneyStore;
use journeycast::services::ServiceRegistry;
use journeycast::tracker::JourneyTracker;
use journeycast::trainer::Trainer;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Live journey tracking and link model training")]
struct Args {
    /// Override the journey snapshot path
    #[arg(long)]
    snapshot_path: Option<PathBuf>,
    /// Override the model artifact cache directory
    #[arg(long)]
    model_cache_path: Option<PathBuf>,
    /// Override the journey refresh interval in seconds
    #[arg(long)]
    refresh_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let mut config = AppConfig::from_env();
    if let Some(snapshot_path) = args.snapshot_path {
        config.snapshot_path = snapshot_path;
    }
    if let Some(model_cache_path) = args.model_cache_path {
        config.model_cache_path = model_cache_path;
    }
    if let Some(refresh_interval) = args.refresh_interval {
        config.refresh_interval = std::time::Duration::from_secs(refresh_interval);
    }

    let bus = EventBus::new();
    let services = ServiceRegistry::new(config.rpc_timeout);
    let store = Arc::new(JourneyStore::load_or_default(&config.snapshot_path));
    info!("Restored {} journeys from snapshot", store.len().await);

    let _tracker = JourneyTracker::setup(
        bus.clone(),
        services.clone(),
        store.clone(),
        config.clone(),
    )
    .await;
    let _trainer = Trainer::setup(bus.clone(), services.clone(), config.clone()).await;

    info!("journeycast started");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down, writing final journey snapshot");
    if let Err(e) = store.write_snapshot(&config.snapshot_path).await {
        warn!("Failed to write journey snapshot on shutdown: {}", e);
    }

    Ok(())
}
