//! Upload proxy binary: fans out uploads to every configured downstream
//! sink with per-sink bounded, drop-head queues (spec §4.6).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::Router;
use clap::Parser;
use streamd::config::{self, UploadProxyConfig};
use streamd::proxy::{Proxy, Sink};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "upload-proxy.toml")]
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
    let settings: UploadProxyConfig = config::load(&args.config)?;
    info!(sinks = settings.sinks.len(), "starting upload proxy");

    let sinks = settings
        .sinks
        .into_iter()
        .map(|s| Sink::new(s.name, s.base_url, s.queue_capacity))
        .collect();
    let proxy = Arc::new(Proxy::new(sinks));
    proxy.spawn_workers();

    if settings.monitoring.enabled {
        tokio::spawn(streamd::metrics::serve(settings.monitoring.address.clone()));
    }

    let app = Router::new().fallback(any(fan_out)).with_state(proxy);
    let listener = tokio::net::TcpListener::bind(&settings.listen_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn fan_out(
    State(proxy): State<Arc<Proxy>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> StatusCode {
    proxy.fan_out(method, uri.path().to_string(), body).await;
    StatusCode::ACCEPTED
}
