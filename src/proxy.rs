//! Upload proxy: fans out every incoming upload to a configurable set of
//! downstream sinks, each with its own bounded, drop-head queue so one slow
//! sink can't back-pressure the others or the uploader (spec §4.6).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry backoff between failed delivery attempts to a sink.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

fn deadline_for(path: &str) -> Duration {
    if path.ends_with(".m3u8") || path.ends_with(".mpd") {
        Duration::from_secs(6)
    } else {
        Duration::from_secs(60)
    }
}

struct QueuedRequest {
    method: Method,
    path: String,
    body: Bytes,
    deadline: Instant,
}

struct SinkQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
    capacity: usize,
}

impl SinkQueue {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::new()), notify: Notify::new(), capacity }
    }

    async fn push(&self, item: QueuedRequest, sink: &str) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item);
        let depth = items.len();
        drop(items);
        crate::metrics::PROXY_QUEUE_DEPTH.with_label_values(&[sink]).set(depth as f64);
        self.notify.notify_one();
    }

    async fn pop(&self, sink: &str) -> QueuedRequest {
        loop {
            let mut items = self.items.lock().await;
            if let Some(item) = items.pop_front() {
                let depth = items.len();
                drop(items);
                crate::metrics::PROXY_QUEUE_DEPTH.with_label_values(&[sink]).set(depth as f64);
                return item;
            }
            drop(items);
            self.notify.notified().await;
        }
    }
}

/// One downstream upload target.
pub struct Sink {
    name: String,
    base_url: String,
    queue: Arc<SinkQueue>,
}

impl Sink {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, queue_capacity: usize) -> Self {
        Self { name: name.into(), base_url: base_url.into(), queue: Arc::new(SinkQueue::new(queue_capacity)) }
    }

    pub async fn handle(&self, method: Method, path: String, body: Bytes) {
        let deadline = Instant::now() + deadline_for(&path);
        self.queue.push(QueuedRequest { method, path, body, deadline }, &self.name).await;
    }

    /// Delivery loop for this sink; runs until cancelled by dropping the
    /// returned `JoinHandle`, or forever if never aborted.
    async fn work(self: Arc<Self>, client: reqwest::Client) {
        loop {
            let request = self.queue.pop(&self.name).await;
            let url = format!("{}{}", self.base_url.trim_end_matches('/'), request.path);
            loop {
                if Instant::now() >= request.deadline {
                    warn!(sink = %self.name, path = %request.path, "dropping request past its deadline");
                    break;
                }
                let attempt = client
                    .request(request.method.clone(), &url)
                    .body(request.body.clone())
                    .send()
                    .await;
                match attempt {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(sink = %self.name, path = %request.path, "delivered");
                        break;
                    }
                    Ok(resp) => {
                        warn!(sink = %self.name, status = %resp.status(), "non-2xx response, retrying");
                    }
                    Err(err) => warn!(sink = %self.name, %err, "delivery failed, retrying"),
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

/// Owns every sink and fans out incoming uploads to all of them.
pub struct Proxy {
    client: reqwest::Client,
    sinks: Vec<Arc<Sink>>,
}

impl Proxy {
    pub fn new(sinks: Vec<Sink>) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .expect("reqwest client");
        Self { client, sinks: sinks.into_iter().map(Arc::new).collect() }
    }

    /// Spawns one delivery task per sink.
    pub fn spawn_workers(&self) {
        for sink in &self.sinks {
            tokio::spawn(Arc::clone(sink).work(self.client.clone()));
        }
    }

    pub async fn fan_out(&self, method: Method, path: String, body: Bytes) {
        for sink in &self.sinks {
            sink.handle(method.clone(), path.clone(), body.clone()).await;
        }
    }
}
