//! Upload server binary: accepts authenticated HTTP uploads from encoders,
//! assembles live HLS playlists, and tracks file lifecycle (spec §4.6–§4.10).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streamd::config::{self, UploadServerConfig};
use streamd::hls::StreamPlaylists;
use streamd::kv::memory::MemoryKv;
use streamd::kv::KvStore;
use streamd::upload::auth::{AuthConfig, AuthEntry, StaticAuth};
use streamd::upload::registry::FileRegistry;
use streamd::upload::rtmp_auth::{on_publish, SettingsWatcher};
use streamd::upload::server::{router, UploadServerState};
use streamd::upload::stream_store::StreamStore;
use tokio::sync::{watch, Mutex};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "upload-server.toml")]
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
    let settings: UploadServerConfig = config::load(&args.config)?;
    info!(listen = %settings.listen_address, "starting upload server");

    let kv = MemoryKv::new();
    let client: Arc<dyn KvStore> = Arc::new(kv.client(
        Duration::from_secs(settings.kv.session_ttl_secs),
        Duration::from_secs(settings.kv.lock_delay_secs),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let auth = StaticAuth::new(AuthConfig {
        allowed_dirs: settings.allowed_dirs.clone(),
        users: settings
            .users
            .iter()
            .map(|u| AuthEntry { user: u.user.clone(), pass: u.pass.clone(), matches: u.matches.clone() })
            .collect(),
    });

    let state = Arc::new(UploadServerState {
        auth,
        stream_store: StreamStore::spawn(shutdown_rx.clone()),
        registry: FileRegistry::spawn(shutdown_rx.clone()),
        playlists: Mutex::new(StreamPlaylists::new(streamd::hls::DEFAULT_WINDOW)),
        base_dir: PathBuf::from(settings.base_dir),
    });

    let settings_watcher = Arc::new(SettingsWatcher::new());
    tokio::spawn(Arc::clone(&settings_watcher).run(client.clone()));

    let rtmp_auth_app =
        axum::Router::new().route("/", axum::routing::post(on_publish)).with_state(settings_watcher);

    if settings.monitoring.enabled {
        tokio::spawn(streamd::metrics::serve(settings.monitoring.address.clone()));
    }

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let upload_listener = tokio::net::TcpListener::bind(&settings.listen_address).await?;
    let rtmp_auth_listener = tokio::net::TcpListener::bind(&settings.rtmp_auth_listen_address).await?;

    let upload_app = router(state);
    tokio::try_join!(
        axum::serve(upload_listener, upload_app),
        axum::serve(rtmp_auth_listener, rtmp_auth_app),
    )?;
    Ok(())
}
