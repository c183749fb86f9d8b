//! Typed store and hub tests.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{key, resource, route, start_hub, upstream, wait_for};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use trellis::core::error::{TrellisError, TrellisResult};
use trellis::kv::{KeyValue, KvBackend, MemoryBackend, Precondition, RangeResult, WatchStream};
use trellis::resource::{ResourceCodec, ResourceKind};
use trellis::store::ListQuery;

/// Memory store that deletes and recreates a key just before the first
/// revision-pinned put lands, like a concurrent writer would.
struct RecreateBeforeUpdate {
    inner: Arc<MemoryBackend>,
    armed: AtomicBool,
}

#[async_trait]
impl KvBackend for RecreateBeforeUpdate {
    async fn range(&self, prefix: &str) -> TrellisResult<RangeResult> {
        self.inner.range(prefix).await
    }

    async fn get(&self, key: &str) -> TrellisResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: Option<Precondition>,
    ) -> TrellisResult<u64> {
        if matches!(precondition, Some(Precondition::ModRevision(_)))
            && self.armed.swap(false, Ordering::SeqCst)
        {
            self.inner.delete(key).await?;
            let mut recreated = route("r1", "/recreated");
            recreated.create_time = 42;
            recreated.update_time = 42;
            self.inner
                .put(key, ResourceCodec::encode(&recreated)?, None)
                .await?;
        }
        self.inner.put(key, value, precondition).await
    }

    async fn delete(&self, key: &str) -> TrellisResult<u64> {
        self.inner.delete(key).await
    }

    async fn watch(&self, prefix: &str, start_revision: u64) -> TrellisResult<WatchStream> {
        self.inner.watch(prefix, start_revision).await
    }
}

// ============================================================================
// Hub
// ============================================================================

#[tokio::test]
async fn unregistered_kind_is_rejected() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    assert!(hub.store(ResourceKind::Route).is_ok());
    let err = hub.store(ResourceKind::Ssl).unwrap_err();
    assert_eq!(
        err,
        TrellisError::UnknownResourceType {
            name: "ssls".to_string()
        }
    );
    assert!(hub.store_by_name("widgets").is_err());
    hub.shutdown().await;
}

#[tokio::test]
async fn hub_loads_existing_keys_before_returning() {
    let backend = std::sync::Arc::new(trellis::kv::MemoryBackend::new());
    backend
        .put(
            &key(ResourceKind::Route, "r1"),
            ResourceCodec::encode(&route("r1", "/a")).unwrap(),
            None,
        )
        .await
        .unwrap();

    let hub = common::start_hub_on(backend, &[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    assert_eq!(store.get("r1").unwrap().field_str("uri"), Some("/a"));
    hub.shutdown().await;
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn create_assigns_id_and_timestamps() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    let created = store
        .create(resource(json!({"uri": "/hello"})))
        .await
        .unwrap();
    assert!(!created.id.is_empty());
    assert!(created.id.chars().all(|c| c.is_ascii_digit()));
    assert!(created.create_time > 0);
    assert_eq!(created.create_time, created.update_time);

    assert!(wait_for(|| store.get(&created.id).is_ok()).await);
    assert_eq!(store.get(&created.id).unwrap(), created);
    hub.shutdown().await;
}

#[tokio::test]
async fn create_twice_conflicts() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    store.create(route("r1", "/a")).await.unwrap();
    let err = store.create(route("r1", "/b")).await.unwrap_err();
    assert_eq!(err, TrellisError::already_exists("r1"));
    assert!(wait_for(|| store.get("r1").is_ok()).await);
    assert_eq!(store.get("r1").unwrap().field_str("uri"), Some("/a"));

    // Once the cache has caught up the check fails without a store round trip.
    let err = store.create_check(&route("r1", "/b")).unwrap_err();
    assert_eq!(err, TrellisError::already_exists("r1"));
    hub.shutdown().await;
}

#[tokio::test]
async fn create_conflict_is_caught_by_the_store_when_cache_lags() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    // Written behind the hub's back while watches are down, so the cache
    // does not know the key yet.
    backend.set_watch_available(false);
    backend
        .put(
            &key(ResourceKind::Route, "r1"),
            ResourceCodec::encode(&route("r1", "/other")).unwrap(),
            None,
        )
        .await
        .unwrap();
    assert!(store.create_check(&route("r1", "/a")).is_ok());

    let err = store.create(route("r1", "/a")).await.unwrap_err();
    assert_eq!(err, TrellisError::already_exists("r1"));
    backend.set_watch_available(true);
    hub.shutdown().await;
}

#[tokio::test]
async fn create_check_has_no_side_effects() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    let before = backend.current_revision();

    let checked = store.create_check(&route("r1", "/a")).unwrap();
    assert_eq!(checked.id, "r1");
    assert_eq!(backend.current_revision(), before);
    assert!(store.get("r1").is_err());
    hub.shutdown().await;
}

#[tokio::test]
async fn invalid_ids_are_rejected() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    let err = store.create(route("bad/id", "/a")).await.unwrap_err();
    assert!(matches!(err, TrellisError::Validation { .. }));
    let err = store
        .create(route(&"x".repeat(65), "/a"))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Validation { .. }));
    hub.shutdown().await;
}

#[tokio::test]
async fn dangling_references_fail_validation() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route, ResourceKind::Upstream]).await;
    let routes = hub.store(ResourceKind::Route).unwrap();
    let upstreams = hub.store(ResourceKind::Upstream).unwrap();

    let linked = resource(json!({"id": "r1", "uri": "/a", "upstream_id": "u1"}));
    let err = routes.create(linked.clone()).await.unwrap_err();
    assert_eq!(err, TrellisError::validation("upstream_id: u1 not found"));

    upstreams.create(upstream("u1")).await.unwrap();
    assert!(wait_for(|| upstreams.get("u1").is_ok()).await);
    routes.create(linked).await.unwrap();
    hub.shutdown().await;
}

#[tokio::test]
async fn consumers_are_keyed_by_username() {
    let (_backend, hub) = start_hub(&[ResourceKind::Consumer]).await;
    let consumers = hub.store(ResourceKind::Consumer).unwrap();

    let created = consumers
        .create(resource(json!({"username": "jack", "plugins": {}})))
        .await
        .unwrap();
    assert_eq!(created.id, "jack");
    assert!(wait_for(|| consumers.get("jack").is_ok()).await);

    let err = consumers
        .create(resource(json!({"plugins": {}})))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Validation { .. }));
    hub.shutdown().await;
}

#[tokio::test]
async fn server_info_is_read_only() {
    let (_backend, hub) = start_hub(&[ResourceKind::ServerInfo]).await;
    let infos = hub.store(ResourceKind::ServerInfo).unwrap();
    let err = infos
        .create(resource(json!({"id": "node-1", "hostname": "gw"})))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Validation { .. }));
    assert!(infos.delete("node-1").await.is_err());
    hub.shutdown().await;
}

// ============================================================================
// Update and delete
// ============================================================================

#[tokio::test]
async fn update_preserves_create_time_and_advances_update_time() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    let created = store.create(route("r1", "/a")).await.unwrap();
    let first = store.update("r1", route("r1", "/b")).await.unwrap();
    let second = store.update("r1", route("", "/c")).await.unwrap();

    assert_eq!(first.create_time, created.create_time);
    assert_eq!(second.create_time, created.create_time);
    assert!(first.update_time > created.update_time);
    assert!(second.update_time > first.update_time);

    assert!(
        wait_for(|| store.get("r1").is_ok_and(|r| r.field_str("uri") == Some("/c"))).await
    );
    let fetched = store.get("r1").unwrap();
    assert_eq!(fetched.create_time, created.create_time);
    hub.shutdown().await;
}

#[tokio::test]
async fn update_of_missing_key_is_not_found() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    let err = store.update("ghost", route("ghost", "/a")).await.unwrap_err();
    assert_eq!(err, TrellisError::not_found("ghost"));
    hub.shutdown().await;
}

#[tokio::test]
async fn update_rejects_mismatched_body_id() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    store.create(route("r1", "/a")).await.unwrap();
    let err = store.update("r1", route("r2", "/a")).await.unwrap_err();
    assert!(matches!(err, TrellisError::Validation { .. }));
    hub.shutdown().await;
}

#[tokio::test]
async fn upsert_creates_then_updates() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    let created = store.upsert("r1", route("", "/a")).await.unwrap();
    assert_eq!(created.id, "r1");
    let updated = store.upsert("r1", route("r1", "/b")).await.unwrap();
    assert_eq!(updated.create_time, created.create_time);
    assert!(
        wait_for(|| store.get("r1").is_ok_and(|r| r.field_str("uri") == Some("/b"))).await
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn update_does_not_inherit_from_a_recreated_key() {
    let inner = Arc::new(MemoryBackend::new());
    let backend = Arc::new(RecreateBeforeUpdate {
        inner: inner.clone(),
        armed: AtomicBool::new(true),
    });
    let hub = common::start_hub_over(backend, &[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    let created = store.create(route("r1", "/a")).await.unwrap();
    assert_ne!(created.create_time, 42);
    let updated = store.update("r1", route("r1", "/b")).await.unwrap();
    assert_eq!(updated.create_time, 42);
    assert!(updated.update_time > 42);

    let stored = inner.get(&key(ResourceKind::Route, "r1")).await.unwrap().unwrap();
    let stored = ResourceCodec::decode("r1", &stored.value).unwrap();
    assert_eq!(stored.create_time, 42);
    assert_eq!(stored.field_str("uri"), Some("/b"));
    hub.shutdown().await;
}

#[tokio::test]
async fn delete_removes_from_store_and_cache() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    store.create(route("r1", "/a")).await.unwrap();
    assert!(wait_for(|| store.get("r1").is_ok()).await);
    store.delete("r1").await.unwrap();
    assert!(backend.is_empty());
    assert!(wait_for(|| store.get("r1").is_err()).await);
    assert_eq!(store.get("r1").unwrap_err(), TrellisError::not_found("r1"));

    let err = store.delete("r1").await.unwrap_err();
    assert_eq!(err, TrellisError::not_found("r1"));
    hub.shutdown().await;
}

#[tokio::test]
async fn delete_rejects_malformed_ids() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    backend
        .put(&key(ResourceKind::Route, "a/b"), Bytes::from_static(b"{}"), None)
        .await
        .unwrap();

    let err = store.delete("a/b").await.unwrap_err();
    assert!(matches!(err, TrellisError::Validation { .. }));
    assert_eq!(backend.len(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn batch_delete_stops_at_first_missing_key() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    for id in ["a", "b", "c"] {
        store.create(route(id, "/x")).await.unwrap();
    }

    let err = store.batch_delete(&["a", "missing", "c"]).await.unwrap_err();
    assert_eq!(err, TrellisError::not_found("missing"));
    assert!(wait_for(|| store.get("a").is_err() && store.get("c").is_ok()).await);

    store.batch_delete(&["b", "c"]).await.unwrap();
    assert!(wait_for(|| store.list(&ListQuery::new()).total_size == 0).await);
    hub.shutdown().await;
}

#[tokio::test]
async fn store_outage_surfaces_as_unavailable() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    store.create(route("r1", "/a")).await.unwrap();
    assert!(wait_for(|| store.get("r1").is_ok()).await);

    backend.set_available(false);
    let err = store.create(route("r2", "/b")).await.unwrap_err();
    assert!(err.is_retriable());
    // Reads keep working from the cache.
    assert!(store.get("r1").is_ok());

    backend.set_available(true);
    hub.shutdown().await;
}

// ============================================================================
// List
// ============================================================================

#[tokio::test]
async fn list_paginates_in_default_order() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    for i in 1..=25 {
        store
            .create(route(&format!("r{:02}", i), "/p"))
            .await
            .unwrap();
    }
    assert!(wait_for(|| store.list(&ListQuery::new()).total_size == 25).await);

    let page = store.list(&ListQuery::new().page(10, 2));
    assert_eq!(page.total_size, 25);
    let ids: Vec<_> = page.rows.iter().map(|r| r.id.clone()).collect();
    let expected: Vec<_> = (11..=20).map(|i| format!("r{:02}", i)).collect();
    assert_eq!(ids, expected);

    let all = store.list(&ListQuery::new());
    assert_eq!(all.rows.len(), 25);

    let first = store.list(&ListQuery::new().page(10, 0));
    assert_eq!(first.rows[0].id, "r01");

    let past_end = store.list(&ListQuery::new().page(10, 4));
    assert!(past_end.rows.is_empty());
    assert_eq!(past_end.total_size, 25);
    hub.shutdown().await;
}

#[tokio::test]
async fn list_filters_and_orders_by_caller_choice() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();
    for (id, uri) in [("a", "/api/1"), ("b", "/web"), ("c", "/api/2")] {
        store.create(route(id, uri)).await.unwrap();
    }
    assert!(wait_for(|| store.cache().len() == 3).await);

    let query = ListQuery::new()
        .filter(|r| r.field_str("uri").is_some_and(|u| u.starts_with("/api")))
        .order_by(|a, b| b.id.cmp(&a.id));
    let output = store.list(&query);
    assert_eq!(output.total_size, 2);
    let ids: Vec<_> = output.rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn writes_from_elsewhere_become_visible() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let store = hub.store(ResourceKind::Route).unwrap();

    backend
        .put(
            &key(ResourceKind::Route, "ext"),
            bytes::Bytes::from_static(br#"{"uri":"/ext"}"#),
            None,
        )
        .await
        .unwrap();

    assert!(wait_for(|| store.get("ext").is_ok()).await);
    // A stored document without an id takes its key.
    assert_eq!(store.get("ext").unwrap().id, "ext");
    hub.shutdown().await;
}
