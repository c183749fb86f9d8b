//! Per-kind in-memory mirror of the store.
//!
//! Writes come from the kind's watch loop only; reads come from any number
//! of request handlers. Every apply is tagged with the store revision that
//! produced it and is dropped if the key already holds that revision or a
//! newer one, including after a delete, so replays and reordered duplicates
//! never move a key backwards.
//!
//! The cache also keeps a revision floor. Everything at or below it is
//! already reflected (by a listing or by a fully applied watch batch), so
//! events at or below the floor are rejected outright and tombstones below
//! it can be forgotten.

use crate::kv::KeyValue;
use crate::resource::validate::KeyLookup;
use crate::resource::{Resource, ResourceCodec, ResourceKind};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One cached key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Full storage key.
    pub key: String,
    /// Raw stored bytes.
    pub value: Bytes,
    /// Store revision that produced this value.
    pub revision: u64,
    /// Decoded form; `None` when the stored bytes did not decode.
    pub resource: Option<Arc<Resource>>,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Resource key -> entry.
    entries: BTreeMap<String, Arc<CacheEntry>>,
    /// Resource key -> revision of the delete that removed it.
    tombstones: HashMap<String, u64>,
    /// Highest revision applied.
    revision: u64,
    /// Events at or below this revision are already reflected.
    floor: u64,
}

impl CacheState {
    /// Whether an event for `key` at `revision` is older than what is held.
    fn is_stale(&self, key: &str, revision: u64) -> bool {
        revision <= self.floor
            || self
                .entries
                .get(key)
                .is_some_and(|entry| entry.revision >= revision)
            || self.tombstones.get(key).is_some_and(|&rev| rev >= revision)
    }
}

/// Cache for one resource kind.
#[derive(Debug)]
pub struct Cache {
    kind: ResourceKind,
    prefix: String,
    state: RwLock<CacheState>,
}

impl Cache {
    /// Create an empty cache for keys under `prefix` (with trailing '/').
    pub fn new(kind: ResourceKind, prefix: impl Into<String>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Kind served by this cache.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Key range prefix covered by this cache.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn resource_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key
            .strip_prefix(self.prefix.as_str())
            .filter(|key| !key.is_empty())
    }

    fn decode(&self, key: &str, value: &Bytes) -> Option<Arc<Resource>> {
        match ResourceCodec::decode(key, value) {
            Ok(resource) => Some(Arc::new(resource)),
            Err(e) => {
                tracing::warn!(
                    kind = %self.kind,
                    key = %key,
                    error = %e,
                    "cached value does not decode"
                );
                None
            }
        }
    }

    /// Record a put at `revision`. Returns whether the cache changed.
    pub fn apply_put(&self, storage_key: &str, value: Bytes, revision: u64) -> bool {
        let Some(key) = self.resource_key(storage_key) else {
            tracing::warn!(
                kind = %self.kind,
                key = %storage_key,
                "ignoring put outside cache prefix"
            );
            return false;
        };

        let mut state = self.state.write();
        if state.is_stale(key, revision) {
            return false;
        }

        let resource = self.decode(key, &value);
        state.tombstones.remove(key);
        state.entries.insert(
            key.to_string(),
            Arc::new(CacheEntry {
                key: storage_key.to_string(),
                value,
                revision,
                resource,
            }),
        );
        state.revision = state.revision.max(revision);
        true
    }

    /// Record a delete at `revision`. Returns whether the cache changed.
    pub fn apply_delete(&self, storage_key: &str, revision: u64) -> bool {
        let Some(key) = self.resource_key(storage_key) else {
            return false;
        };

        let mut state = self.state.write();
        if state.is_stale(key, revision) {
            return false;
        }

        let removed = state.entries.remove(key).is_some();
        state.tombstones.insert(key.to_string(), revision);
        state.revision = state.revision.max(revision);
        removed
    }

    /// Mark every event up to `revision` as reflected and drop the
    /// tombstones it makes redundant.
    pub fn advance_floor(&self, revision: u64) {
        let mut state = self.state.write();
        if revision <= state.floor {
            return;
        }
        state.floor = revision;
        state.tombstones.retain(|_, rev| *rev > revision);
    }

    /// Replace the whole cache with a listing taken at `revision`.
    ///
    /// Keys missing from the listing are dropped, tombstones are cleared,
    /// and the floor moves to the listing revision. A listing older than the
    /// floor is ignored.
    pub fn replace_all(&self, kvs: Vec<KeyValue>, revision: u64) -> bool {
        let mut entries = BTreeMap::new();
        for kv in kvs {
            let Some(key) = self.resource_key(&kv.key) else {
                continue;
            };
            let key = key.to_string();
            let resource = self.decode(&key, &kv.value);
            entries.insert(
                key,
                Arc::new(CacheEntry {
                    key: kv.key,
                    value: kv.value,
                    revision: kv.mod_revision,
                    resource,
                }),
            );
        }

        let mut state = self.state.write();
        if revision < state.floor {
            tracing::warn!(
                kind = %self.kind,
                revision,
                floor = state.floor,
                "ignoring listing older than the cache"
            );
            return false;
        }
        state.entries = entries;
        state.tombstones.clear();
        state.floor = revision;
        state.revision = state.revision.max(revision);
        true
    }

    /// Entry for a resource key.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.state.read().entries.get(key).cloned()
    }

    /// Whether a resource key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.state.read().entries.contains_key(key)
    }

    /// Ordered copy of every entry, taken under a single read lock.
    pub fn snapshot(&self) -> Vec<Arc<CacheEntry>> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Highest revision applied so far.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    /// Revision at or below which events are ignored.
    pub fn floor(&self) -> u64 {
        self.state.read().floor
    }

    /// Number of delete markers currently held.
    pub fn tombstone_count(&self) -> usize {
        self.state.read().tombstones.len()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches of every registered kind, used for foreign-key checks.
#[derive(Debug, Default)]
pub struct CacheSet {
    caches: BTreeMap<ResourceKind, Arc<Cache>>,
}

impl CacheSet {
    /// Register a cache.
    pub fn insert(&mut self, cache: Arc<Cache>) {
        self.caches.insert(cache.kind(), cache);
    }

    /// Cache for a kind.
    pub fn get(&self, kind: ResourceKind) -> Option<&Arc<Cache>> {
        self.caches.get(&kind)
    }
}

impl KeyLookup for CacheSet {
    fn contains_key(&self, kind: ResourceKind, key: &str) -> bool {
        self.caches
            .get(&kind)
            .is_some_and(|cache| cache.contains(key))
    }

    fn is_registered(&self, kind: ResourceKind) -> bool {
        self.caches.contains_key(&kind)
    }
}
