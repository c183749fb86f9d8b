//! In-process MVCC key-value store.
//!
//! `MemoryBackend` keeps the same revision model as etcd: one global
//! revision counter bumped by every mutation, per-revision history for watch
//! replay, and a compaction floor below which history is discarded. It backs
//! the `memory` store mode and doubles as the injected store in tests, with
//! switches to simulate outages and dropped watch streams.

use super::{
    EventType, KeyValue, KvBackend, Precondition, RangeResult, WatchEvent, WatchItem, WatchStream,
};
use crate::core::error::{TrellisError, TrellisResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Revisions of history kept for watch replay before older ones are
/// compacted away.
pub const DEFAULT_HISTORY_RETENTION: u64 = 10_000;

#[derive(Debug, Clone)]
struct Record {
    value: Bytes,
    create_revision: u64,
    mod_revision: u64,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchItem>,
}

#[derive(Debug)]
struct MemoryState {
    /// Current revision (last mutation).
    revision: u64,

    /// Live keys.
    index: BTreeMap<String, Record>,

    /// Revision -> event produced at that revision.
    history: BTreeMap<u64, WatchEvent>,

    /// Oldest revision still present in history.
    compaction_floor: u64,

    /// Active subscriptions.
    watchers: Vec<Watcher>,

    /// Simulated outage: every call fails.
    unavailable: bool,

    /// Simulated watch outage: new watches fail, reads and writes work.
    watch_unavailable: bool,

    /// Number of most recent revisions kept in history.
    retention: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            revision: 0,
            index: BTreeMap::new(),
            history: BTreeMap::new(),
            compaction_floor: 0,
            watchers: Vec::new(),
            unavailable: false,
            watch_unavailable: false,
            retention: DEFAULT_HISTORY_RETENTION,
        }
    }
}

impl MemoryState {
    fn check_available(&self) -> TrellisResult<()> {
        if self.unavailable {
            return Err(TrellisError::unavailable("memory store is offline"));
        }
        Ok(())
    }

    fn record(&mut self, event: WatchEvent) {
        self.history.insert(event.revision, event.clone());
        if self.revision > self.retention {
            self.compact_to(self.revision - self.retention + 1);
        }
        let batch = vec![event];
        self.watchers.retain(|watcher| {
            if !batch[0].key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(batch.clone())).is_ok()
        });
    }

    /// Drop history below `revision`. Returns the number of entries removed.
    fn compact_to(&mut self, revision: u64) -> usize {
        let floor = revision.min(self.revision);
        if floor <= self.compaction_floor {
            return 0;
        }
        let retained = self.history.split_off(&floor);
        let removed = self.history.len();
        self.history = retained;
        self.compaction_floor = floor;
        removed
    }

    fn disconnect_all(&mut self, reason: &str) {
        for watcher in self.watchers.drain(..) {
            let _ = watcher.tx.send(Err(TrellisError::unavailable(reason)));
        }
    }
}

/// In-process authoritative store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty store at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that keeps only the last `revisions` revisions
    /// of history.
    pub fn with_history_retention(revisions: u64) -> Self {
        let backend = Self::default();
        backend.state.lock().retention = revisions.max(1);
        backend
    }

    /// Current store revision.
    pub fn current_revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Oldest revision a watch may start from.
    pub fn compaction_floor(&self) -> u64 {
        self.state.lock().compaction_floor
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open watch subscriptions.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Discard history below `revision`.
    ///
    /// Watches that later ask to start below the floor fail with
    /// `StreamCompacted`. Returns the number of history entries removed.
    pub fn compact(&self, revision: u64) -> usize {
        let mut state = self.state.lock();
        let removed = state.compact_to(revision);
        tracing::debug!(
            floor = state.compaction_floor,
            removed,
            "memory store compacted"
        );
        removed
    }

    /// Toggle a full outage. Going offline drops every watch stream.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.unavailable = !available;
        if !available {
            state.disconnect_all("memory store went offline");
        }
    }

    /// Toggle watch availability only. Going offline drops every watch stream.
    pub fn set_watch_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.watch_unavailable = !available;
        if !available {
            state.disconnect_all("watch service went offline");
        }
    }

    /// Break every open watch stream with a transient error.
    pub fn disconnect_watchers(&self) {
        self.state.lock().disconnect_all("watch stream reset");
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn range(&self, prefix: &str) -> TrellisResult<RangeResult> {
        let state = self.state.lock();
        state.check_available()?;

        let kvs = state
            .index
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| KeyValue {
                key: key.clone(),
                value: record.value.clone(),
                create_revision: record.create_revision,
                mod_revision: record.mod_revision,
            })
            .collect();

        Ok(RangeResult {
            kvs,
            revision: state.revision,
        })
    }

    async fn get(&self, key: &str) -> TrellisResult<Option<KeyValue>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.index.get(key).map(|record| KeyValue {
            key: key.to_string(),
            value: record.value.clone(),
            create_revision: record.create_revision,
            mod_revision: record.mod_revision,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: Option<Precondition>,
    ) -> TrellisResult<u64> {
        let mut state = self.state.lock();
        state.check_available()?;

        let existing = state.index.get(key).cloned();
        let holds = match precondition {
            None => true,
            Some(Precondition::MustNotExist) => existing.is_none(),
            Some(Precondition::MustExist) => existing.is_some(),
            Some(Precondition::ModRevision(revision)) => existing
                .as_ref()
                .is_some_and(|record| record.mod_revision == revision),
        };
        if !holds {
            return Err(TrellisError::PreconditionFailed {
                key: key.to_string(),
            });
        }

        state.revision += 1;
        let revision = state.revision;
        let create_revision = existing.map_or(revision, |r| r.create_revision);
        state.index.insert(
            key.to_string(),
            Record {
                value: value.clone(),
                create_revision,
                mod_revision: revision,
            },
        );
        state.record(WatchEvent::put(key, value, revision));
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> TrellisResult<u64> {
        let mut state = self.state.lock();
        state.check_available()?;

        if state.index.remove(key).is_none() {
            return Err(TrellisError::not_found(key));
        }
        state.revision += 1;
        let revision = state.revision;
        state.record(WatchEvent::delete(key, revision));
        Ok(revision)
    }

    async fn watch(&self, prefix: &str, start_revision: u64) -> TrellisResult<WatchStream> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.watch_unavailable {
            return Err(TrellisError::unavailable("watch service is offline"));
        }

        let (tx, stream) = WatchStream::channel();
        let start = if start_revision == 0 {
            state.revision + 1
        } else {
            start_revision
        };

        if start < state.compaction_floor {
            let _ = tx.send(Err(TrellisError::StreamCompacted {
                requested: start,
                compact_revision: state.compaction_floor,
            }));
            return Ok(stream);
        }

        let replay: Vec<WatchEvent> = state
            .history
            .range(start..)
            .map(|(_, event)| event)
            .filter(|event| event.key.starts_with(prefix))
            .cloned()
            .collect();
        if !replay.is_empty() {
            let _ = tx.send(Ok(replay));
        }

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(stream)
    }

    async fn close(&self) {
        self.state.lock().disconnect_all("memory store closed");
    }
}

impl MemoryBackend {
    /// Count history events of a given type still available for replay.
    pub fn history_count(&self, event_type: EventType) -> usize {
        self.state
            .lock()
            .history
            .values()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}
