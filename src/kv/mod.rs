//! Session-bound, prefix-watchable key/value store abstraction (spec §4.1).
//!
//! The production backend this crate is modeled after is etcd, but no
//! etcd client crate ships in this workspace's dependency pack, so the
//! only implementation provided is `memory::MemoryKv`, an in-process store
//! with the same session/watch contract. A production deployment swaps in
//! an etcd- or consul-backed `KvStore` without touching any caller, since
//! every caller only depends on this trait.

pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;

use crate::error::KvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub kind: UpdateKind,
    pub key: String,
    pub value: Vec<u8>,
}

impl Update {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self { kind: UpdateKind::Put, key: key.into(), value }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self { kind: UpdateKind::Delete, key: key.into(), value: Vec::new() }
    }
}

/// A batch of ordered updates as observed by the store (spec §4.1, §5).
pub type UpdateBatch = Vec<Update>;

pub type WatchStream = Pin<Box<dyn Stream<Item = UpdateBatch> + Send>>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Unconditional write.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Unconditional delete.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Create-or-refresh `key` iff it is unbound or bound to this client's
    /// session. Fails with `KvError::AcquireConflict` otherwise.
    async fn put_with_session(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Subscribe to `prefix`. The first batch is a full snapshot (every
    /// currently-live key under `prefix`, each delivered as a `Put`);
    /// subsequent batches contain only changes observed from then on.
    fn watch(&self, prefix: &str) -> WatchStream;
}
