//! Tracks which origin is currently uploading each slug, ageing out
//! streams that stop uploading (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::info;

use crate::error::UploadError;

pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(2);

struct Stream {
    origin: String,
    ttl: Duration,
    origin_locked_until: Option<Instant>,
}

impl Stream {
    fn new(origin: String) -> Self {
        Self { origin, ttl: STREAM_TIMEOUT, origin_locked_until: None }
    }

    /// Accepts a re-upload from `origin`. An origin change is refused while
    /// locked, matching `Stream.Update`'s half-timeout lockout in the
    /// original: a flapping encoder shouldn't bounce between two origins.
    fn update(&mut self, origin: &str, now: Instant) -> Result<(), UploadError> {
        if origin != self.origin {
            if self.origin_locked_until.is_some_and(|until| until > now) {
                return Err(UploadError::InvalidOrigin);
            }
            self.origin = origin.to_string();
            self.origin_locked_until = Some(now + STREAM_TIMEOUT / 2);
        }
        self.ttl = STREAM_TIMEOUT;
        Ok(())
    }

    fn age(&mut self, by: Duration) -> bool {
        self.ttl = self.ttl.saturating_sub(by);
        self.ttl.is_zero()
    }
}

/// Shared registry of active upload origins, one entry per slug.
pub struct StreamStore {
    streams: Mutex<HashMap<String, Stream>>,
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStore {
    pub fn new() -> Self {
        Self { streams: Mutex::new(HashMap::new()) }
    }

    /// Constructs a store and spawns its ageing loop, returning a shared
    /// handle. The loop runs until `shutdown` fires.
    pub fn spawn(shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let store = Arc::new(Self::new());
        tokio::spawn(Arc::clone(&store).run(shutdown));
        store
    }

    /// Registers an upload from `origin` for `slug`, creating the stream if
    /// it doesn't exist yet.
    pub async fn update_stream(&self, slug: &str, origin: &str) -> Result<(), UploadError> {
        let mut streams = self.streams.lock().await;
        let now = Instant::now();
        match streams.get_mut(slug) {
            Some(stream) => stream.update(origin, now),
            None => {
                streams.insert(slug.to_string(), Stream::new(origin.to_string()));
                Ok(())
            }
        }
    }

    pub async fn contains(&self, slug: &str) -> bool {
        self.streams.lock().await.contains_key(slug)
    }

    async fn age_all(&self) {
        let mut streams = self.streams.lock().await;
        let expired: Vec<String> = streams
            .iter_mut()
            .filter_map(|(slug, s)| s.age(EXPIRE_INTERVAL).then(|| slug.clone()))
            .collect();
        for slug in &expired {
            streams.remove(slug);
        }
        drop(streams);
        for slug in expired {
            info!(%slug, "stream upload timed out");
        }
    }

    /// Runs the ageing loop until `shutdown` fires.
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(EXPIRE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => self.age_all().await,
            }
        }
    }
}
