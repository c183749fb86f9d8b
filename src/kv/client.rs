//! Prefix-scoped store client.
//!
//! `KvClient` wraps a [`KvBackend`] with the configured root prefix and a
//! deadline on every unary call. A call that misses its deadline fails with
//! `StoreUnavailable` and has no further effect on the caller's state.

use super::{KeyValue, KvBackend, MemoryBackend, Precondition, RangeResult, WatchStream};
use crate::core::config::StoreConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::resource::ResourceKind;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Handle to the authoritative store.
#[derive(Clone)]
pub struct KvClient {
    backend: Arc<dyn KvBackend>,
    prefix: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("prefix", &self.prefix)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl KvClient {
    /// Connect to the backend selected by `config.backend`.
    pub async fn connect(config: &StoreConfig) -> TrellisResult<Self> {
        let backend: Arc<dyn KvBackend> = match config.backend.as_str() {
            "memory" => Arc::new(MemoryBackend::new()),
            #[cfg(feature = "grpc")]
            "etcd" => Arc::new(
                super::etcd::EtcdBackend::connect(
                    &config.endpoints,
                    config.connect_timeout(),
                )
                .await?,
            ),
            other => {
                return Err(TrellisError::unavailable(format!(
                    "store backend '{}' is not available in this build",
                    other
                )))
            }
        };

        tracing::info!(
            backend = %config.backend,
            prefix = %config.prefix,
            "connected to store"
        );
        Ok(Self::with_backend(
            backend,
            &config.prefix,
            config.request_timeout(),
        ))
    }

    /// Wrap an existing backend.
    pub fn with_backend(
        backend: Arc<dyn KvBackend>,
        prefix: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let prefix: String = prefix.into();
        Self {
            backend,
            prefix: prefix.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    /// Root key prefix, without a trailing separator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Deadline applied to unary calls.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Key range prefix for a kind.
    pub fn kind_prefix(&self, kind: ResourceKind) -> String {
        kind.key_prefix(&self.prefix)
    }

    /// Full storage key for a resource.
    pub fn storage_key(&self, kind: ResourceKind, key: &str) -> String {
        kind.storage_key(&self.prefix, key)
    }

    /// List every stored resource of a kind.
    pub async fn list(&self, kind: ResourceKind) -> TrellisResult<RangeResult> {
        let prefix = self.kind_prefix(kind);
        self.deadline("range", self.backend.range(&prefix)).await
    }

    /// Read one key.
    pub async fn get(&self, key: &str) -> TrellisResult<Option<KeyValue>> {
        self.deadline("get", self.backend.get(key)).await
    }

    /// Write one key.
    pub async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: Option<Precondition>,
    ) -> TrellisResult<u64> {
        self.deadline("put", self.backend.put(key, value, precondition))
            .await
    }

    /// Delete one key.
    pub async fn delete(&self, key: &str) -> TrellisResult<u64> {
        self.deadline("delete", self.backend.delete(key)).await
    }

    /// Open a watch on a kind's key range starting at `start_revision`.
    ///
    /// Only establishing the subscription is bounded by the deadline; the
    /// stream itself is long-lived.
    pub async fn watch(
        &self,
        kind: ResourceKind,
        start_revision: u64,
    ) -> TrellisResult<WatchStream> {
        let prefix = self.kind_prefix(kind);
        self.deadline("watch", self.backend.watch(&prefix, start_revision))
            .await
    }

    /// Release backend connections.
    pub async fn close(&self) {
        self.backend.close().await;
    }

    async fn deadline<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = TrellisResult<T>>,
    ) -> TrellisResult<T> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    op,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "store request timed out"
                );
                Err(TrellisError::unavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.request_timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keys_are_scoped_under_the_prefix() {
        let client = KvClient::with_backend(
            Arc::new(MemoryBackend::new()),
            "/apisix/",
            Duration::from_secs(1),
        );
        assert_eq!(client.prefix(), "/apisix");
        assert_eq!(
            client.storage_key(ResourceKind::Upstream, "u1"),
            "/apisix/upstreams/u1"
        );

        client
            .put("/apisix/upstreams/u1", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        client
            .put("/apisix/routes/r1", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();

        let listing = client.list(ResourceKind::Upstream).await.unwrap();
        assert_eq!(listing.kvs.len(), 1);
        assert_eq!(listing.revision, 2);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let client = KvClient::with_backend(backend, "/apisix", Duration::from_secs(1));
        let err = client.list(ResourceKind::Route).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
