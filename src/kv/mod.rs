//! Authoritative key-value store access.
//!
//! - [`client`] - Prefix-scoped client with request deadlines
//! - [`memory`] - In-process MVCC store (embedded mode and tests)
//! - [`etcd`] - etcd v3 gRPC backend (feature `grpc`)
//!
//! Every backend implements [`KvBackend`]. Revisions are store-assigned,
//! strictly increasing across the whole key space, and returned on every
//! mutation and listing so the watch loop can resume precisely.

pub mod client;
#[cfg(feature = "grpc")]
pub mod etcd;
pub mod memory;

pub use client::KvClient;
pub use memory::MemoryBackend;

use crate::core::error::TrellisResult;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A live key with its value and last modification revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: u64,
    pub mod_revision: u64,
}

/// Point-in-time listing of a key range.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// Keys in ascending order.
    pub kvs: Vec<KeyValue>,
    /// Store revision at which the listing was taken.
    pub revision: u64,
}

/// Condition checked atomically with a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The key must not currently exist.
    MustNotExist,
    /// The key must currently exist.
    MustExist,
    /// The key must exist and have been last modified at this revision.
    ModRevision(u64),
}

/// Event type for watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted.
    Delete,
}

/// A single change delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub key: String,
    /// New value for puts; `None` for deletes.
    pub value: Option<Bytes>,
    /// Revision of the mutation that produced this event.
    pub revision: u64,
}

impl WatchEvent {
    /// Create a Put event.
    pub fn put(key: impl Into<String>, value: Bytes, revision: u64) -> Self {
        Self {
            event_type: EventType::Put,
            key: key.into(),
            value: Some(value),
            revision,
        }
    }

    /// Create a Delete event.
    pub fn delete(key: impl Into<String>, revision: u64) -> Self {
        Self {
            event_type: EventType::Delete,
            key: key.into(),
            value: None,
            revision,
        }
    }
}

/// Items carried by a watch channel: a batch of events in revision order,
/// or a terminal error.
pub type WatchItem = TrellisResult<Vec<WatchEvent>>;

/// Receiving half of a watch subscription.
///
/// The stream ends (`None`) when the backend drops the subscription. A
/// `StreamCompacted` item means the requested start revision is gone and
/// the subscriber must relist.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchItem>,
}

impl WatchStream {
    /// Create a linked sender/stream pair.
    pub fn channel() -> (mpsc::UnboundedSender<WatchItem>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next batch. Blocks without a deadline.
    pub async fn next(&mut self) -> Option<WatchItem> {
        self.rx.recv().await
    }
}

/// Operations consumed from the authoritative store.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// List every key starting with `prefix` at a single revision.
    async fn range(&self, prefix: &str) -> TrellisResult<RangeResult>;

    /// Read one key.
    async fn get(&self, key: &str) -> TrellisResult<Option<KeyValue>>;

    /// Write a key, optionally conditioned on its existence.
    ///
    /// Fails with `PreconditionFailed` when the condition does not hold.
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: Option<Precondition>,
    ) -> TrellisResult<u64>;

    /// Delete a key. Fails with `NotFound` when it does not exist.
    async fn delete(&self, key: &str) -> TrellisResult<u64>;

    /// Subscribe to changes under `prefix` with revision >= `start_revision`.
    async fn watch(&self, prefix: &str, start_revision: u64) -> TrellisResult<WatchStream>;

    /// Release connections held by the backend.
    async fn close(&self) {}
}
