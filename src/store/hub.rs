//! Registry of typed stores.
//!
//! The hub is built once at startup. It lists every registered kind before
//! returning, so an unreachable store fails startup, then hands each kind's
//! session to a background watch task. The set of kinds is fixed afterwards.

use super::cache::{Cache, CacheSet};
use super::typed::TypedStore;
use super::watch::{WatchLoop, WatchSession, WatchStatus};
use crate::core::config::WatchConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::core::time::IdGenerator;
use crate::kv::KvClient;
use crate::resource::ResourceKind;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owner of every typed store and its watch task.
#[derive(Debug)]
pub struct StoreHub {
    client: KvClient,
    stores: BTreeMap<ResourceKind, Arc<TypedStore>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreHub {
    /// Register `kinds`, load their caches, and start their watch loops.
    pub async fn init(
        client: KvClient,
        kinds: &[ResourceKind],
        watch_config: &WatchConfig,
        node_id: u16,
    ) -> TrellisResult<Arc<Self>> {
        let ids = Arc::new(IdGenerator::new(node_id));

        let mut caches = CacheSet::default();
        for &kind in kinds {
            caches.insert(Arc::new(Cache::new(kind, client.kind_prefix(kind))));
        }
        let caches = Arc::new(caches);

        let mut stores = BTreeMap::new();
        let mut loops = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            if stores.contains_key(&kind) {
                continue;
            }
            let cache = caches
                .get(kind)
                .cloned()
                .ok_or_else(|| TrellisError::UnknownResourceType {
                    name: kind.name().to_string(),
                })?;
            let session = Arc::new(WatchSession::new(kind));
            let store = TypedStore::new(
                client.clone(),
                cache.clone(),
                caches.clone(),
                ids.clone(),
                session.clone(),
            );
            let watch_loop = WatchLoop::new(client.clone(), cache, session, watch_config.clone());

            watch_loop.initial_sync().await.map_err(|e| {
                tracing::error!(kind = %kind, error = %e, "initial listing failed");
                e
            })?;

            stores.insert(kind, Arc::new(store));
            loops.push(watch_loop);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = loops
            .into_iter()
            .map(|watch_loop| tokio::spawn(watch_loop.run(shutdown_rx.clone())))
            .collect();

        tracing::info!(kinds = stores.len(), "store hub initialized");
        Ok(Arc::new(Self {
            client,
            stores,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Store for `kind`.
    pub fn store(&self, kind: ResourceKind) -> TrellisResult<Arc<TypedStore>> {
        self.stores
            .get(&kind)
            .cloned()
            .ok_or_else(|| TrellisError::UnknownResourceType {
                name: kind.name().to_string(),
            })
    }

    /// Store for a kind given by name, e.g. "routes".
    pub fn store_by_name(&self, name: &str) -> TrellisResult<Arc<TypedStore>> {
        let kind: ResourceKind = name.parse()?;
        self.store(kind)
    }

    /// Registered kinds in order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.stores.keys().copied().collect()
    }

    pub fn client(&self) -> &KvClient {
        &self.client
    }

    /// Watch progress of every kind.
    pub fn statuses(&self) -> Vec<WatchStatus> {
        self.stores.values().map(|store| store.status()).collect()
    }

    /// Stop every watch loop and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "watch task panicked");
            }
        }
        tracing::info!("store hub stopped");
    }
}
