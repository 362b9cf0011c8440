//! Transcoder node: claims streams via the KV store's session-bound put,
//! and drives one transcode unit per claimed stream (spec §4.3).

pub mod unit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::kv::{KvStore, UpdateKind};
use crate::model::{StreamDescriptor, TranscoderStatus};
use crate::transcode::unit::{Service, UnitDriver};

/// Registration TTL, and the period at which a node refreshes its own
/// session and re-evaluates claims.
pub const TRANSCODER_TTL: Duration = Duration::from_secs(10);
const TRANSCODER_PREFIX: &str = "/service/transcode/";
const STREAM_PREFIX: &str = "/stream/";

/// `output` and `type` are fixed literals (spec §4.3/§6); only `stream_key`,
/// `format`, `transcoding_source` and `transcoding_sink` vary per claim.
const UNIT_OUTPUT: &str = "direct";
const UNIT_TYPE: &str = "h264-only";

#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub stream_key: String,
    pub format: String,
    pub transcoding_source: String,
    pub transcoding_sink: String,
}

impl UnitConfig {
    pub fn render(&self) -> String {
        format!(
            "stream_key={}\nformat={}\noutput={UNIT_OUTPUT}\ntype={UNIT_TYPE}\ntranscoding_source={}\ntranscoding_sink={}\n",
            self.stream_key, self.format, self.transcoding_source, self.transcoding_sink,
        )
    }
}

pub struct NodeConfig {
    pub name: String,
    pub capacity: i64,
    pub sink: String,
}

/// One claimed stream's running unit and the descriptor it was claimed for.
struct Job {
    descriptor: StreamDescriptor,
    shutdown: watch::Sender<bool>,
}

pub struct Node {
    config: NodeConfig,
    kv: Arc<dyn KvStore>,
    make_driver: Box<dyn Fn() -> Box<dyn UnitDriver> + Send + Sync>,
    jobs: tokio::sync::Mutex<HashMap<String, Job>>,
    peers: tokio::sync::Mutex<HashMap<String, TranscoderStatus>>,
    streams: tokio::sync::Mutex<HashMap<String, StreamDescriptor>>,
    /// Claimant recorded under each stream's `/stream/<slug>/transcoder`
    /// child key, as seen via watch - not necessarily this node.
    stream_transcoders: tokio::sync::Mutex<HashMap<String, String>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        kv: Arc<dyn KvStore>,
        make_driver: Box<dyn Fn() -> Box<dyn UnitDriver> + Send + Sync>,
    ) -> Self {
        Self {
            config,
            kv,
            make_driver,
            jobs: tokio::sync::Mutex::new(HashMap::new()),
            peers: tokio::sync::Mutex::new(HashMap::new()),
            streams: tokio::sync::Mutex::new(HashMap::new()),
            stream_transcoders: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Registers this node, then watches peers and streams until `shutdown`
    /// fires. Registration retries every 3s for up to 30s before giving up
    /// (spec §4.3 startup protocol).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.register_with_retry().await?;

        let mut peer_watch = self.kv.watch(TRANSCODER_PREFIX);
        let mut stream_watch = self.kv.watch(STREAM_PREFIX);
        let mut ticker = tokio::time::interval(TRANSCODER_TTL / 2);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.teardown().await;
                        return Ok(());
                    }
                }
                batch = peer_watch.next() => {
                    match batch {
                        Some(updates) => self.apply_peer_updates(updates).await,
                        None => warn!("peer watch stream closed"),
                    }
                }
                batch = stream_watch.next() => {
                    match batch {
                        Some(updates) => self.apply_stream_updates(updates).await,
                        None => warn!("stream watch stream closed"),
                    }
                }
                _ = ticker.tick() => {
                    self.register().await;
                    self.reap_vanished_streams().await;
                    self.evaluate_claims().await;
                }
            }
        }
    }

    async fn register_with_retry(&self) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            match self.try_register().await {
                Ok(()) => return Ok(()),
                Err(err) if tokio::time::Instant::now() < deadline => {
                    warn!(%err, "registration failed, retrying in 3s");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn register(&self) {
        if let Err(err) = self.try_register().await {
            warn!(%err, "failed to refresh registration");
        }
    }

    async fn try_register(&self) -> anyhow::Result<()> {
        let jobs = self.jobs.lock().await;
        let status = TranscoderStatus {
            name: self.config.name.clone(),
            capacity: self.config.capacity,
            streams: jobs.keys().cloned().collect(),
        };
        drop(jobs);
        let key = format!("{TRANSCODER_PREFIX}{}", self.config.name);
        let value = serde_json::to_vec(&status)?;
        self.kv.put_with_session(&key, value).await?;
        Ok(())
    }

    async fn apply_peer_updates(&self, updates: Vec<crate::kv::Update>) {
        let mut peers = self.peers.lock().await;
        for update in updates {
            let name = update.key.trim_start_matches(TRANSCODER_PREFIX).to_string();
            match update.kind {
                UpdateKind::Put => match serde_json::from_slice::<TranscoderStatus>(&update.value) {
                    Ok(status) => {
                        peers.insert(name, status);
                    }
                    Err(err) => warn!(%err, "malformed transcoder status"),
                },
                UpdateKind::Delete => {
                    peers.remove(&name);
                }
            }
        }
    }

    async fn apply_stream_updates(&self, updates: Vec<crate::kv::Update>) {
        let mut removed = Vec::new();
        let mut reevaluate = Vec::new();
        {
            let mut streams = self.streams.lock().await;
            let mut transcoders = self.stream_transcoders.lock().await;
            for update in updates {
                if !update.key.starts_with(STREAM_PREFIX) {
                    continue;
                }
                if update.key.matches('/').count() > 2 {
                    // Child key `/stream/<slug>/transcoder`: records who
                    // currently claims the stream, not the descriptor itself.
                    let Some(slug) = update.key.trim_start_matches(STREAM_PREFIX).strip_suffix("/transcoder") else {
                        continue;
                    };
                    match update.kind {
                        UpdateKind::Put => {
                            let name = String::from_utf8_lossy(&update.value).into_owned();
                            transcoders.insert(slug.to_string(), name);
                        }
                        UpdateKind::Delete => {
                            transcoders.remove(slug);
                            if streams.contains_key(slug) {
                                reevaluate.push(slug.to_string());
                            }
                        }
                    }
                    continue;
                }
                let slug = update.key.trim_start_matches(STREAM_PREFIX).to_string();
                match update.kind {
                    UpdateKind::Put => match serde_json::from_slice::<StreamDescriptor>(&update.value) {
                        Ok(descriptor) => {
                            streams.insert(slug.clone(), descriptor);
                            reevaluate.push(slug);
                        }
                        Err(err) => warn!(%err, "malformed stream descriptor"),
                    },
                    UpdateKind::Delete => {
                        streams.remove(&slug);
                        transcoders.remove(&slug);
                        removed.push(slug);
                    }
                }
            }
        }
        for slug in removed {
            self.stop_job(&slug).await;
        }
        for slug in reevaluate {
            self.try_claim(&slug).await;
        }
    }

    async fn reap_vanished_streams(&self) {
        let streams = self.streams.lock().await;
        let jobs = self.jobs.lock().await;
        let vanished: Vec<String> = jobs
            .keys()
            .filter(|slug| !streams.contains_key(slug.as_str()))
            .cloned()
            .collect();
        drop(jobs);
        drop(streams);
        for slug in vanished {
            self.stop_job(&slug).await;
        }
    }

    /// Re-evaluates whether this node should claim any unclaimed stream,
    /// per `ShouldClaim` (spec §4.3, §9 open question 4: ties break by name).
    async fn evaluate_claims(&self) {
        let slugs: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        for slug in slugs {
            self.try_claim(&slug).await;
        }
    }

    /// Attempts to claim one stream, if it's still unclaimed, this node has
    /// spare capacity, and `ShouldClaim` holds. Called both from the 5s
    /// ticker (`evaluate_claims`) and immediately on a stream-root PUT or a
    /// freed `transcoder` child key (spec §4.3 item 2).
    async fn try_claim(&self, slug: &str) {
        if let Some(claimant) = self.stream_transcoders.lock().await.get(slug) {
            if claimant != &self.config.name {
                return;
            }
        }
        let Some(descriptor) = self.streams.lock().await.get(slug).cloned() else {
            return;
        };
        let jobs = self.jobs.lock().await;
        if jobs.contains_key(slug) {
            return;
        }
        let active = jobs.len() as i64;
        drop(jobs);
        if self.config.capacity - active <= 0 {
            return;
        }
        if !self.should_claim().await {
            return;
        }
        if let Err(err) = self.claim_stream(descriptor).await {
            warn!(%err, "failed to claim stream");
        }
    }

    async fn should_claim(&self) -> bool {
        let peers = self.peers.lock().await;
        let mut candidates: Vec<&TranscoderStatus> = peers.values().collect();
        if candidates.is_empty() {
            // No known peers means no top candidate at all, not a trivial win.
            return false;
        }
        candidates.sort_by(|a, b| a.load_cmp(b));
        candidates[0].name == self.config.name
    }

    async fn claim_stream(&self, descriptor: StreamDescriptor) -> anyhow::Result<()> {
        let key = format!("/stream/{}/transcoder", descriptor.slug);
        self.kv
            .put_with_session(&key, self.config.name.clone().into_bytes())
            .await?;

        let config = UnitConfig {
            stream_key: descriptor.slug.clone(),
            format: descriptor.format.clone(),
            transcoding_source: descriptor.source.clone(),
            transcoding_sink: self.config.sink.clone(),
        };
        let mut service = Service::new((self.make_driver)());
        service.apply(&descriptor.slug, config.render()).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slug = descriptor.slug.clone();
        tokio::spawn(service.keepalive(slug.clone(), shutdown_rx));

        info!(slug = %descriptor.slug, node = %self.config.name, "claimed stream");
        crate::metrics::STREAM_CLAIMS.with_label_values(&[&self.config.name]).inc();
        self.jobs
            .lock()
            .await
            .insert(descriptor.slug.clone(), Job { descriptor, shutdown: shutdown_tx });
        Ok(())
    }

    async fn stop_job(&self, slug: &str) {
        if let Some(job) = self.jobs.lock().await.remove(slug) {
            let _ = job.shutdown.send(true);
            info!(%slug, "released stream");
        }
    }

    async fn teardown(&self) {
        let slugs: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        for slug in slugs {
            self.stop_job(&slug).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::transcode::unit::RunningUnit;
    use async_trait::async_trait;

    #[test]
    fn unit_config_renders_the_fixed_key_value_format() {
        let config = UnitConfig {
            stream_key: "hall1".into(),
            format: "matroska".into(),
            transcoding_source: "rtmp://origin/hall1".into(),
            transcoding_sink: "rtmp://sink/hall1".into(),
        };
        assert_eq!(
            config.render(),
            "stream_key=hall1\nformat=matroska\noutput=direct\ntype=h264-only\n\
             transcoding_source=rtmp://origin/hall1\ntranscoding_sink=rtmp://sink/hall1\n"
        );
    }

    struct NoopDriver;

    struct NoopUnit;

    #[async_trait]
    impl RunningUnit for NoopUnit {
        async fn has_exited(&mut self) -> bool {
            false
        }
        async fn stop(&mut self) {}
    }

    #[async_trait]
    impl UnitDriver for NoopDriver {
        async fn start(&self, _config: &str) -> anyhow::Result<Box<dyn RunningUnit>> {
            Ok(Box::new(NoopUnit))
        }
    }

    fn node(name: &str, capacity: i64, kv: Arc<dyn KvStore>) -> Node {
        Node::new(
            NodeConfig { name: name.into(), capacity, sink: "sink".into() },
            kv,
            Box::new(|| Box::new(NoopDriver)),
        )
    }

    #[tokio::test]
    async fn should_claim_is_false_with_no_peers() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let n = node("solo", 4, client);
        assert!(!n.should_claim().await);
    }

    #[tokio::test]
    async fn should_claim_picks_least_loaded_breaking_ties_by_name() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let n = node("node-b", 4, client);
        n.peers.lock().await.insert(
            "node-a".into(),
            TranscoderStatus { name: "node-a".into(), capacity: 4, streams: vec![] },
        );
        n.peers.lock().await.insert(
            "node-b".into(),
            TranscoderStatus { name: "node-b".into(), capacity: 4, streams: vec![] },
        );
        assert!(!n.should_claim().await);
    }

    #[tokio::test]
    async fn claim_stream_starts_a_unit_and_records_the_job() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let n = node("solo", 4, client);
        let descriptor = StreamDescriptor {
            slug: "hall1".into(),
            source: "rtmp://origin/hall1".into(),
            format: "matroska".into(),
            published_at: 0,
        };
        n.claim_stream(descriptor).await.unwrap();
        assert!(n.jobs.lock().await.contains_key("hall1"));
    }

    fn descriptor(slug: &str) -> StreamDescriptor {
        StreamDescriptor {
            slug: slug.into(),
            source: format!("rtmp://origin/{slug}"),
            format: "matroska".into(),
            published_at: 0,
        }
    }

    #[tokio::test]
    async fn already_claimed_child_key_blocks_a_redundant_claim_attempt() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let n = node("solo", 4, client);
        n.peers.lock().await.insert(
            "solo".into(),
            TranscoderStatus { name: "solo".into(), capacity: 4, streams: vec![] },
        );
        n.streams.lock().await.insert("hall1".into(), descriptor("hall1"));

        n.apply_stream_updates(vec![crate::kv::Update::put("/stream/hall1/transcoder", b"other-node".to_vec())])
            .await;
        n.evaluate_claims().await;
        assert!(!n.jobs.lock().await.contains_key("hall1"));
    }

    #[tokio::test]
    async fn freeing_the_child_key_triggers_an_immediate_claim_attempt() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let n = node("solo", 4, client);
        n.peers.lock().await.insert(
            "solo".into(),
            TranscoderStatus { name: "solo".into(), capacity: 4, streams: vec![] },
        );
        n.streams.lock().await.insert("hall1".into(), descriptor("hall1"));

        n.apply_stream_updates(vec![crate::kv::Update::put("/stream/hall1/transcoder", b"other-node".to_vec())])
            .await;
        assert!(!n.jobs.lock().await.contains_key("hall1"));

        n.apply_stream_updates(vec![crate::kv::Update::delete("/stream/hall1/transcoder")]).await;
        assert!(n.jobs.lock().await.contains_key("hall1"));
    }
}
