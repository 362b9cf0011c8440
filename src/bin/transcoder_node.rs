//! Transcoder node binary: claims streams from the KV store and drives one
//! transcode process per claim (spec §4.3).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streamd::config::{self, TranscoderNodeConfig};
use streamd::kv::memory::MemoryKv;
use streamd::kv::KvStore;
use streamd::transcode::unit::ProcessUnitDriver;
use streamd::transcode::{Node, NodeConfig};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "transcoder-node.toml")]
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
    let settings: TranscoderNodeConfig = config::load(&args.config)?;
    info!(name = %settings.name, capacity = settings.capacity, "starting transcoder node");

    // No etcd client crate is available in this workspace (see src/kv/mod.rs);
    // a production deployment points this at a shared cluster KV store instead.
    let kv = MemoryKv::new();
    let client: Arc<dyn KvStore> = Arc::new(kv.client(
        Duration::from_secs(settings.kv.session_ttl_secs),
        Duration::from_secs(settings.kv.lock_delay_secs),
    ));

    let binary = settings.transcode_binary.clone();
    let node = Node::new(
        NodeConfig {
            name: settings.name.clone(),
            capacity: settings.capacity,
            sink: settings.sink.clone(),
        },
        client,
        Box::new(move || Box::new(ProcessUnitDriver { binary: binary.clone(), extra_args: vec![] })),
    );

    if settings.monitoring.enabled {
        tokio::spawn(streamd::metrics::serve(settings.monitoring.address.clone()));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = node.run(shutdown_rx).await {
        error!(%err, "transcoder node exited with error");
    }
    Ok(())
}
