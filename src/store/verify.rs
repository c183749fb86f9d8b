//! Cache consistency verification.
//!
//! For each registered kind the verifier reads the key range straight from
//! the store, snapshots the cache, and compares the two byte-for-byte over
//! the union of their keys. The read and the snapshot are not atomic with
//! respect to each other, so a write landing between them can show up as a
//! transient inconsistency.

use super::hub::StoreHub;
use crate::core::error::TrellisResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A key whose store and cache values differ. A missing side is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistentPair {
    pub key: String,
    pub authoritative_value: Option<String>,
    pub cached_value: Option<String>,
}

/// Comparison result for one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindReport {
    pub total: usize,
    pub consistent_count: usize,
    pub inconsistent_count: usize,
    pub inconsistent_pairs: Vec<InconsistentPair>,
}

/// Aggregate comparison result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total: usize,
    pub consistent_count: usize,
    pub inconsistent_count: usize,
    pub items: BTreeMap<String, KindReport>,
}

impl VerificationReport {
    /// Add one kind's result to the totals.
    pub fn add(&mut self, name: impl Into<String>, report: KindReport) {
        self.total += report.total;
        self.consistent_count += report.consistent_count;
        self.inconsistent_count += report.inconsistent_count;
        self.items.insert(name.into(), report);
    }

    /// Whether every compared key matched.
    pub fn is_consistent(&self) -> bool {
        self.inconsistent_count == 0
    }

    /// Human-readable summary followed by every inconsistent pair.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "cache verification result as follows:");
        let _ = writeln!(
            out,
            "There are {} items in total, {} of them are consistent, {} of them are inconsistent",
            self.total, self.consistent_count, self.inconsistent_count
        );
        for (name, report) in &self.items {
            let _ = writeln!(
                out,
                "{:<15}: {} in total,{} consistent,{} inconsistent",
                name, report.total, report.consistent_count, report.inconsistent_count
            );
        }
        for report in self.items.values() {
            for pair in &report.inconsistent_pairs {
                let _ = writeln!(out, "[key]({})", pair.key);
                let _ = writeln!(
                    out,
                    "[etcd]({})",
                    pair.authoritative_value.as_deref().unwrap_or("")
                );
                let _ = writeln!(out, "[cache]({})", pair.cached_value.as_deref().unwrap_or(""));
            }
        }
        out
    }
}

/// Compare an authoritative listing with a cache snapshot, both keyed by
/// full storage key.
pub fn diff<A, C>(authoritative: A, cached: C) -> KindReport
where
    A: IntoIterator<Item = (String, Bytes)>,
    C: IntoIterator<Item = (String, Bytes)>,
{
    let authoritative: BTreeMap<String, Bytes> = authoritative.into_iter().collect();
    let mut cached: BTreeMap<String, Bytes> = cached.into_iter().collect();

    let mut report = KindReport::default();
    for (key, value) in authoritative {
        report.total += 1;
        match cached.remove(&key) {
            Some(cached_value) if cached_value == value => report.consistent_count += 1,
            cached_value => {
                report.inconsistent_count += 1;
                report.inconsistent_pairs.push(InconsistentPair {
                    key,
                    authoritative_value: Some(render(&value)),
                    cached_value: cached_value.as_ref().map(render),
                });
            }
        }
    }
    for (key, value) in cached {
        report.total += 1;
        report.inconsistent_count += 1;
        report.inconsistent_pairs.push(InconsistentPair {
            key,
            authoritative_value: None,
            cached_value: Some(render(&value)),
        });
    }
    report.inconsistent_pairs.sort_by(|a, b| a.key.cmp(&b.key));
    report
}

fn render(value: &Bytes) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// Compare every registered kind's cache with the store.
pub async fn verify(hub: &StoreHub) -> TrellisResult<VerificationReport> {
    let mut report = VerificationReport::default();
    for kind in hub.kinds() {
        let store = hub.store(kind)?;
        let listing = hub.client().list(kind).await?;
        let snapshot = store.cache().snapshot();

        let kind_report = diff(
            listing.kvs.into_iter().map(|kv| (kv.key, kv.value)),
            snapshot
                .iter()
                .map(|entry| (entry.key.clone(), entry.value.clone())),
        );
        tracing::debug!(
            kind = %kind,
            total = kind_report.total,
            inconsistent = kind_report.inconsistent_count,
            "kind verified"
        );
        report.add(kind.name(), kind_report);
    }

    if report.is_consistent() {
        tracing::info!(total = report.total, "cache consistent with store");
    } else {
        tracing::warn!(
            total = report.total,
            inconsistent = report.inconsistent_count,
            "cache inconsistent with store"
        );
    }
    Ok(report)
}
