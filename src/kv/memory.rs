//! In-memory `KvStore` implementation with session/lease semantics modeled
//! on etcd's lease+watch contract: a session is granted a TTL, kept alive
//! by a background task, and any key written with `put_with_session` is
//! released when the session expires, after a short lock-delay (spec §4.1).

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::KvError;
use crate::kv::{KvStore, Update, UpdateBatch, WatchStream};

const REAP_INTERVAL: Duration = Duration::from_secs(1);

struct Entry {
    value: Vec<u8>,
    session: Option<Uuid>,
}

struct SessionState {
    last_seen: Instant,
    ttl: Duration,
    lock_delay: Duration,
}

struct Inner {
    data: DashMap<String, Entry>,
    sessions: DashMap<Uuid, SessionState>,
    tx: broadcast::Sender<Update>,
}

/// A cluster-wide shared in-memory store. Clone cheaply; call `client()`
/// once per logical process to obtain a session-bound handle.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        let inner = Arc::new(Inner { data: DashMap::new(), sessions: DashMap::new(), tx });
        spawn_reaper(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Create a new session-bound client with the given TTL and lock-delay
    /// (spec defaults: TTL=10s, lock-delay=5s).
    pub fn client(&self, ttl: Duration, lock_delay: Duration) -> KvClient {
        let id = Uuid::new_v4();
        self.inner.sessions.insert(
            id,
            SessionState { last_seen: Instant::now(), ttl, lock_delay },
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        spawn_keepalive(Arc::clone(&self.inner), id, ttl, stop_rx);
        KvClient { inner: Arc::clone(&self.inner), session_id: id, _stop: stop_tx }
    }

    /// Number of keys currently bound to a live session. Used by tests.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.data.len()
    }
}

fn spawn_keepalive(inner: Arc<Inner>, id: Uuid, ttl: Duration, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let period = ttl / 2;
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(period) => {
                    if let Some(mut state) = inner.sessions.get_mut(&id) {
                        state.last_seen = Instant::now();
                    } else {
                        return;
                    }
                }
            }
        }
    });
}

fn spawn_reaper(inner: Weak<Inner>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REAP_INTERVAL).await;
            let Some(inner) = inner.upgrade() else { return };
            let now = Instant::now();
            let mut expired = Vec::new();
            for entry in inner.sessions.iter() {
                if now.duration_since(entry.last_seen) > entry.ttl {
                    expired.push((*entry.key(), entry.lock_delay));
                }
            }
            for (id, lock_delay) in expired {
                inner.sessions.remove(&id);
                info!(session = %id, "kv session expired, scheduling release");
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(lock_delay).await;
                    release_session_keys(&inner, id);
                });
            }
        }
    });
}

fn release_session_keys(inner: &Inner, session_id: Uuid) {
    let keys: Vec<String> = inner
        .data
        .iter()
        .filter(|e| e.session == Some(session_id))
        .map(|e| e.key().clone())
        .collect();
    for key in keys {
        if inner.data.remove_if(&key, |_, v| v.session == Some(session_id)).is_some() {
            debug!(key = %key, session = %session_id, "kv key released after session expiry");
            let _ = inner.tx.send(Update::delete(key));
        }
    }
}

/// A session-bound handle into a `MemoryKv`. Dropping it stops the
/// keepalive task; the session then expires naturally after its TTL,
/// mirroring an etcd client crashing without revoking its lease.
pub struct KvClient {
    inner: Arc<Inner>,
    session_id: Uuid,
    _stop: watch::Sender<bool>,
}

impl KvClient {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[async_trait]
impl KvStore for KvClient {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.inner.data.insert(key.to_string(), Entry { value: value.clone(), session: None });
        let _ = self.inner.tx.send(Update::put(key, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.data.remove(key);
        let _ = self.inner.tx.send(Update::delete(key));
        Ok(())
    }

    async fn put_with_session(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        use dashmap::mapref::entry::Entry as DashEntry;
        match self.inner.data.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) => {
                let bound = occ.get().session;
                if bound.is_some() && bound != Some(self.session_id) {
                    return Err(KvError::AcquireConflict);
                }
                occ.insert(Entry { value: value.clone(), session: Some(self.session_id) });
            }
            DashEntry::Vacant(vac) => {
                vac.insert(Entry { value: value.clone(), session: Some(self.session_id) });
            }
        }
        let _ = self.inner.tx.send(Update::put(key, value));
        Ok(())
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        let prefix = prefix.to_string();
        let rx = self.inner.tx.subscribe();

        let snapshot: UpdateBatch = self
            .inner
            .data
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| Update::put(e.key().clone(), e.value().value.clone()))
            .collect();

        let tail = futures::stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
            loop {
                match rx.recv().await {
                    Ok(update) if update.key.starts_with(&prefix) => {
                        return Some((vec![update], (rx, prefix)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "kv watcher lagged, skipping batches");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Box::pin(stream::once(async move { snapshot }).chain(tail))
    }
}
