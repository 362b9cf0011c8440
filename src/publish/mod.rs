//! Publisher: polls scrapers on a fixed tick, republishes live streams into
//! the KV store under `/stream/<slug>`, and lets stale ones age out
//! (spec §4.2).

pub mod scraper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::error::KvError;
use crate::kv::KvStore;
use crate::model::StreamDescriptor;
use crate::publish::scraper::Scraper;

/// How often the publisher polls all scrapers and ages tracked streams.
pub const TICK_INTERVAL: Duration = Duration::from_secs(3);
/// A stream not re-seen within this many ticks' worth of time is unpublished.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-scrape timeout; a hung origin must not stall the whole tick.
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(1);

struct Tracked {
    descriptor: StreamDescriptor,
    ttl: Duration,
    /// Guards against an origin flapping between two different sources for
    /// the same slug within half the timeout window (spec §4.2).
    origin_locked_until: Option<tokio::time::Instant>,
}

pub struct Publisher {
    kv: Arc<dyn KvStore>,
    scrapers: Vec<Box<dyn Scraper>>,
    streams: tokio::sync::Mutex<HashMap<String, Tracked>>,
}

impl Publisher {
    pub fn new(kv: Arc<dyn KvStore>, scrapers: Vec<Box<dyn Scraper>>) -> Self {
        Self { kv, scrapers, streams: tokio::sync::Mutex::new(HashMap::new()) }
    }

    /// Runs until `shutdown` is set to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("publisher shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        for scraper in &self.scrapers {
            match timeout(SCRAPE_TIMEOUT, scraper.scrape()).await {
                Ok(Ok(descriptors)) => self.process_update(scraper.name(), descriptors).await,
                Ok(Err(err)) => warn!(scraper = scraper.name(), %err, "scrape failed"),
                Err(_) => warn!(scraper = scraper.name(), "scrape timed out"),
            }
        }
        self.age_and_expire().await;
    }

    async fn process_update(&self, scraper_name: &str, descriptors: Vec<StreamDescriptor>) {
        let mut streams = self.streams.lock().await;
        let now = tokio::time::Instant::now();
        for mut descriptor in descriptors {
            match streams.get_mut(&descriptor.slug) {
                Some(existing) => {
                    if existing.descriptor.source != descriptor.source {
                        if existing.origin_locked_until.is_some_and(|until| until > now) {
                            debug!(slug = %descriptor.slug, "origin change rejected, still locked");
                            continue;
                        }
                        existing.origin_locked_until = Some(now + STREAM_TIMEOUT / 2);
                    }
                    existing.descriptor = descriptor.clone();
                    existing.ttl = STREAM_TIMEOUT;
                    let _ = self.publish(&existing.descriptor).await;
                }
                None => {
                    descriptor.published_at = 0;
                    let tracked = Tracked {
                        descriptor: descriptor.clone(),
                        ttl: STREAM_TIMEOUT,
                        origin_locked_until: None,
                    };
                    if self.publish(&tracked.descriptor).await.is_ok() {
                        info!(scraper = scraper_name, slug = %descriptor.slug, "stream published");
                        streams.insert(descriptor.slug.clone(), tracked);
                    } else {
                        debug!(slug = %descriptor.slug, "skipping, slug already claimed by another publisher");
                    }
                }
            }
        }
    }

    /// Writes `descriptor` to the KV store under its slug's key. Returns
    /// `Err` if the write failed, notably `KvError::AcquireConflict` when
    /// another publisher already holds the slug (spec §4.2: on
    /// already-acquired, the caller must skip rather than track the stream).
    async fn publish(&self, descriptor: &StreamDescriptor) -> anyhow::Result<()> {
        let key = format!("/stream/{}", descriptor.slug);
        let value = match serde_json::to_vec(descriptor) {
            Ok(value) => value,
            Err(err) => {
                warn!(slug = %descriptor.slug, %err, "failed to encode stream descriptor");
                return Err(err.into());
            }
        };
        match self.kv.put_with_session(&key, value).await {
            Ok(()) => Ok(()),
            Err(err @ KvError::AcquireConflict) => {
                debug!(slug = %descriptor.slug, "already-acquired, another publisher owns this slug");
                Err(err.into())
            }
            Err(err) => {
                warn!(slug = %descriptor.slug, %err, "failed to publish stream");
                Err(err.into())
            }
        }
    }

    async fn age_and_expire(&self) {
        let mut streams = self.streams.lock().await;
        let mut expired = Vec::new();
        for (slug, tracked) in streams.iter_mut() {
            tracked.ttl = tracked.ttl.saturating_sub(TICK_INTERVAL);
            if tracked.ttl.is_zero() {
                expired.push(slug.clone());
            }
        }
        for slug in expired {
            streams.remove(&slug);
            let key = format!("/stream/{slug}");
            if let Err(err) = self.kv.delete(&key).await {
                warn!(%slug, %err, "failed to unpublish expired stream");
            } else {
                info!(%slug, "stream expired, unpublished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedScraper {
        streams: Vec<StreamDescriptor>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Scraper for FixedScraper {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn scrape(&self) -> anyhow::Result<Vec<StreamDescriptor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.streams.clone())
        }
    }

    #[tokio::test]
    async fn tick_publishes_new_streams() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let scraper = Box::new(FixedScraper {
            streams: vec![StreamDescriptor {
                slug: "hall1".into(),
                source: "rtmp://origin/hall1".into(),
                format: "matroska".into(),
                published_at: 0,
            }],
            calls: AtomicUsize::new(0),
        });
        let publisher = Publisher::new(client.clone(), vec![scraper]);
        publisher.tick().await;

        let mut watch = client.watch("/stream/");
        use tokio_stream::StreamExt;
        let snapshot = watch.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "/stream/hall1");
    }

    #[tokio::test]
    async fn origin_change_is_locked_for_half_the_timeout() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let publisher = Publisher::new(client.clone(), vec![]);
        {
            let mut streams = publisher.streams.lock().await;
            streams.insert(
                "hall1".into(),
                Tracked {
                    descriptor: StreamDescriptor {
                        slug: "hall1".into(),
                        source: "rtmp://a".into(),
                        format: "matroska".into(),
                        published_at: 0,
                    },
                    ttl: STREAM_TIMEOUT,
                    origin_locked_until: None,
                },
            );
        }
        publisher
            .process_update(
                "test",
                vec![StreamDescriptor {
                    slug: "hall1".into(),
                    source: "rtmp://b".into(),
                    format: "matroska".into(),
                    published_at: 0,
                }],
            )
            .await;
        let streams = publisher.streams.lock().await;
        assert_eq!(streams.get("hall1").unwrap().descriptor.source, "rtmp://b");
    }
}
