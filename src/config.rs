//! Per-binary configuration (`config::Config` + `clap::Parser`), one
//! struct per process since each binary only needs a slice of the overall
//! deployment's settings.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    /// Session TTL for claims this process holds (spec §4.1 default 10s).
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Delay before a key is released after its owning session expires.
    #[serde(default = "default_lock_delay_secs")]
    pub lock_delay_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    10
}

fn default_lock_delay_secs() -> u64 {
    5
}

impl Default for KvConfig {
    fn default() -> Self {
        Self { session_ttl_secs: default_session_ttl_secs(), lock_delay_secs: default_lock_delay_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
    #[serde(default = "default_monitoring_address")]
    pub address: String,
}

fn default_monitoring_enabled() -> bool {
    true
}

fn default_monitoring_address() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enabled: default_monitoring_enabled(), address: default_monitoring_address() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderNodeConfig {
    pub name: String,
    pub capacity: i64,
    pub sink: String,
    #[serde(default = "default_transcode_binary")]
    pub transcode_binary: String,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

fn default_transcode_binary() -> String {
    "ffmpeg".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IcecastSourceConfig {
    pub name: String,
    pub base_url: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub icecast_sources: Vec<IcecastSourceConfig>,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadUserConfig {
    pub user: String,
    pub pass: String,
    #[serde(rename = "match")]
    pub matches: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadServerConfig {
    pub listen_address: String,
    pub base_dir: String,
    pub allowed_dirs: Vec<String>,
    pub users: Vec<UploadUserConfig>,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// HTTP address the RTMP server posts `on_publish` callbacks to.
    #[serde(default = "default_rtmp_auth_listen")]
    pub rtmp_auth_listen_address: String,
}

fn default_rtmp_auth_listen() -> String {
    "0.0.0.0:8089".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySinkConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_sink_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_sink_queue_capacity() -> usize {
    128
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadProxyConfig {
    pub listen_address: String,
    pub sinks: Vec<ProxySinkConfig>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Loads and deserializes `path` (any format `config::Config` can detect -
/// YAML, TOML, JSON) into `T`.
pub fn load<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let settings = config::Config::builder().add_source(config::File::with_name(path)).build()?;
    Ok(settings.try_deserialize()?)
}
