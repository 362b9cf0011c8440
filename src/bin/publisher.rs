//! Publisher binary: polls configured origin scrapers and republishes live
//! streams into the KV store (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streamd::config::{self, PublisherConfig};
use streamd::kv::memory::MemoryKv;
use streamd::kv::KvStore;
use streamd::publish::scraper::{IcecastScraper, Scraper};
use streamd::publish::Publisher;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "publisher.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings: PublisherConfig = config::load(&args.config)?;
    info!(sources = settings.icecast_sources.len(), "starting publisher");

    let kv = MemoryKv::new();
    let client: Arc<dyn KvStore> = Arc::new(kv.client(
        Duration::from_secs(settings.kv.session_ttl_secs),
        Duration::from_secs(settings.kv.lock_delay_secs),
    ));

    let scrapers: Vec<Box<dyn Scraper>> = settings
        .icecast_sources
        .into_iter()
        .map(|s| -> Box<dyn Scraper> {
            Box::new(IcecastScraper::new(s.name, s.base_url, s.user, s.password))
        })
        .collect();

    if settings.monitoring.enabled {
        tokio::spawn(streamd::metrics::serve(settings.monitoring.address.clone()));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let publisher = Publisher::new(client, scrapers);
    publisher.run(shutdown_rx).await;
    Ok(())
}
