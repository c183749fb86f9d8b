//! Consistency verifier tests.

mod common;

use bytes::Bytes;
use common::{key, route, start_hub, wait_for};
use trellis::kv::KvBackend;
use trellis::resource::ResourceKind;
use trellis::store::verify::{diff, InconsistentPair};
use trellis::store::{verify, VerificationReport};

fn side(pairs: &[(&str, &str)]) -> Vec<(String, Bytes)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Bytes::from(v.to_string())))
        .collect()
}

// ============================================================================
// Diff
// ============================================================================

#[test]
fn symmetric_difference_over_key_union() {
    let report = diff(
        side(&[("a", "1"), ("b", "2"), ("c", "3")]),
        side(&[("a", "1"), ("b", "9"), ("d", "4")]),
    );

    assert_eq!(report.total, 4);
    assert_eq!(report.consistent_count, 1);
    assert_eq!(report.inconsistent_count, 3);
    assert_eq!(
        report.inconsistent_pairs,
        vec![
            InconsistentPair {
                key: "b".into(),
                authoritative_value: Some("2".into()),
                cached_value: Some("9".into()),
            },
            InconsistentPair {
                key: "c".into(),
                authoritative_value: Some("3".into()),
                cached_value: None,
            },
            InconsistentPair {
                key: "d".into(),
                authoritative_value: None,
                cached_value: Some("4".into()),
            },
        ]
    );
}

#[test]
fn empty_sides_produce_empty_report() {
    let report = diff(side(&[]), side(&[]));
    assert_eq!(report.total, 0);
    assert!(report.inconsistent_pairs.is_empty());
}

#[test]
fn aggregate_sums_kinds_and_serializes_nulls() {
    let mut report = VerificationReport::default();
    report.add("routes", diff(side(&[("a", "1")]), side(&[("a", "1")])));
    report.add("ssls", diff(side(&[("s", "x")]), side(&[])));

    assert_eq!(report.total, 2);
    assert_eq!(report.consistent_count, 1);
    assert_eq!(report.inconsistent_count, 1);
    assert_eq!(
        report.total,
        report.consistent_count + report.inconsistent_count
    );

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(
        json["items"]["ssls"]["inconsistent_pairs"][0]["cached_value"],
        serde_json::Value::Null
    );
    assert_eq!(json["items"]["routes"]["consistent_count"], 1);
}

// ============================================================================
// Against a live hub
// ============================================================================

#[tokio::test]
async fn synced_hub_is_consistent() {
    let (_backend, hub) = start_hub(&[ResourceKind::Route, ResourceKind::Upstream]).await;
    let routes = hub.store(ResourceKind::Route).unwrap();
    routes.create(route("r1", "/a")).await.unwrap();
    routes.create(route("r2", "/b")).await.unwrap();
    assert!(wait_for(|| routes.cache().len() == 2).await);

    let report = verify(&hub).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.total, 2);
    assert_eq!(report.items["routes"].total, 2);
    assert_eq!(report.items["upstreams"].total, 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn frozen_cache_is_reported() {
    let (backend, hub) = start_hub(&[ResourceKind::Route]).await;
    let routes = hub.store(ResourceKind::Route).unwrap();
    routes.create(route("r1", "/a")).await.unwrap();
    assert!(wait_for(|| routes.get("r1").is_ok()).await);
    assert!(wait_for(|| backend.watcher_count() == 1).await);

    // Watches are down and writes land behind the cache's back.
    backend.set_watch_available(false);
    backend
        .put(
            &key(ResourceKind::Route, "r1"),
            Bytes::from_static(br#"{"id":"r1","uri":"/changed"}"#),
            None,
        )
        .await
        .unwrap();
    backend
        .put(
            &key(ResourceKind::Route, "r2"),
            Bytes::from_static(br#"{"id":"r2","uri":"/new"}"#),
            None,
        )
        .await
        .unwrap();

    let report = verify(&hub).await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.inconsistent_count, 2);
    let pairs = &report.items["routes"].inconsistent_pairs;
    assert_eq!(pairs[0].key, "/apisix/routes/r1");
    assert_eq!(pairs[1].cached_value, None);

    let text = report.render_text();
    assert!(text.contains("[key](/apisix/routes/r2)"));

    backend.set_watch_available(true);
    assert!(wait_for(|| routes.get("r2").is_ok()).await);
    hub.shutdown().await;
}
