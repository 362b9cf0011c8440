//! Prometheus metrics: claim/discontinuity/registry/queue-depth counters
//! and gauges registered at startup, exposed on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_gauge_vec, CounterVec, Encoder, GaugeVec,
    IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// Incremented every time a transcoder node claims a stream.
    pub static ref STREAM_CLAIMS: CounterVec = register_counter_vec!(
        "streamd_stream_claims_total",
        "Number of streams claimed by this transcoder node",
        &["node"]
    )
    .unwrap();

    /// Incremented every time the HLS assembler inserts a discontinuity.
    pub static ref HLS_DISCONTINUITIES: CounterVec = register_counter_vec!(
        "streamd_hls_discontinuities_total",
        "Number of EXT-X-DISCONTINUITY markers inserted per variant",
        &["slug", "variant"]
    )
    .unwrap();

    /// Current number of files tracked by the file lifecycle registry.
    pub static ref REGISTRY_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "streamd_file_registry_entries",
        "Number of files currently tracked by the upload server's file registry",
        &["instance"]
    )
    .unwrap();

    /// Current queue depth of an upload proxy sink.
    pub static ref PROXY_QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "streamd_proxy_queue_depth",
        "Number of pending requests queued for an upload proxy sink",
        &["sink"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Serves `/metrics` until the process exits. Each binary spawns this as a
/// background task when its `monitoring.enabled` config flag is set.
pub async fn serve(address: String) {
    let app = axum::Router::new().route("/metrics", axum::routing::get(|| async { gather_metrics() }));
    match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(%err, "monitoring server exited");
            }
        }
        Err(err) => tracing::error!(%address, %err, "failed to bind monitoring listener"),
    }
}
