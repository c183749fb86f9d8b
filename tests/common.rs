//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use trellis::core::config::WatchConfig;
use trellis::kv::{KvBackend, KvClient, MemoryBackend};
use trellis::resource::{Resource, ResourceKind};
use trellis::store::StoreHub;

pub const PREFIX: &str = "/apisix";

/// Write `content` to a temporary config file.
pub fn create_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a minimal valid configuration file using the memory backend.
pub fn create_memory_config() -> NamedTempFile {
    create_config(
        r#"
[store]
backend = "memory"
endpoints = []
"#,
    )
}

/// Watch settings with short delays so recovery happens quickly in tests.
pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        retry_timeout_ms: 1_000,
        backoff_initial_ms: 5,
        backoff_max_ms: 50,
        max_resume_failures: 3,
    }
}

/// A fresh memory backend and a client over it.
pub fn memory_client() -> (Arc<MemoryBackend>, KvClient) {
    let backend = Arc::new(MemoryBackend::new());
    let client = KvClient::with_backend(backend.clone(), PREFIX, Duration::from_secs(2));
    (backend, client)
}

/// Start a hub over `backend` for `kinds`.
pub async fn start_hub_on(backend: Arc<MemoryBackend>, kinds: &[ResourceKind]) -> Arc<StoreHub> {
    start_hub_over(backend, kinds).await
}

/// Start a hub over any backend implementation.
pub async fn start_hub_over(backend: Arc<dyn KvBackend>, kinds: &[ResourceKind]) -> Arc<StoreHub> {
    let client = KvClient::with_backend(backend, PREFIX, Duration::from_secs(2));
    StoreHub::init(client, kinds, &fast_watch_config(), 1)
        .await
        .expect("hub init")
}

/// Start a hub over a new memory backend.
pub async fn start_hub(kinds: &[ResourceKind]) -> (Arc<MemoryBackend>, Arc<StoreHub>) {
    let backend = Arc::new(MemoryBackend::new());
    let hub = start_hub_on(backend.clone(), kinds).await;
    (backend, hub)
}

/// Poll `condition` every few milliseconds until it holds or two seconds pass.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Build a resource from a JSON document.
pub fn resource(doc: Value) -> Resource {
    Resource::from_value(doc).expect("valid resource document")
}

/// A route with the given id and uri.
pub fn route(id: &str, uri: &str) -> Resource {
    resource(serde_json::json!({ "id": id, "uri": uri }))
}

/// An upstream with a single node.
pub fn upstream(id: &str) -> Resource {
    resource(serde_json::json!({
        "id": id,
        "type": "roundrobin",
        "nodes": { "127.0.0.1:8080": 1 }
    }))
}

/// Full storage key for a resource.
pub fn key(kind: ResourceKind, id: &str) -> String {
    kind.storage_key(PREFIX, id)
}
