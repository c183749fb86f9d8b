//! Background synchronisation of one cache with the store.
//!
//! The loop lists the kind's key range once, then streams changes from the
//! revision after the last one applied. Transient failures resume the stream
//! from the same point; compaction, or too many failed resumes in a row,
//! forces a fresh listing. Attempts are separated by capped exponential
//! backoff and each attempt has its own deadline. Waiting for the next event
//! has none. Errors end up in logs and the session status only.

use super::cache::Cache;
use crate::core::backoff::Backoff;
use crate::core::config::WatchConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::kv::{EventType, KvClient, WatchEvent, WatchStream};
use crate::resource::ResourceKind;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle phase of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPhase {
    Initializing,
    Listing,
    Streaming,
    Erroring,
    Closed,
}

/// Shared progress of one kind's watch loop.
#[derive(Debug)]
pub struct WatchSession {
    kind: ResourceKind,
    phase: RwLock<WatchPhase>,
    last_applied: AtomicU64,
    events_applied: AtomicU64,
    relists: AtomicU64,
    resume_failures: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Point-in-time view of a [`WatchSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchStatus {
    pub kind: ResourceKind,
    pub phase: WatchPhase,
    pub last_applied_revision: u64,
    pub events_applied: u64,
    pub relists: u64,
    pub resume_failures: u64,
    pub last_error: Option<String>,
}

impl WatchSession {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            phase: RwLock::new(WatchPhase::Initializing),
            last_applied: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            relists: AtomicU64::new(0),
            resume_failures: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn phase(&self) -> WatchPhase {
        *self.phase.read()
    }

    /// Highest store revision applied to the cache by this session.
    pub fn last_applied_revision(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Revision a resumed subscription starts from.
    pub fn resume_revision(&self) -> u64 {
        self.last_applied_revision() + 1
    }

    /// Number of completed listings, the initial one included.
    pub fn relists(&self) -> u64 {
        self.relists.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> WatchStatus {
        WatchStatus {
            kind: self.kind,
            phase: self.phase(),
            last_applied_revision: self.last_applied_revision(),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            relists: self.relists(),
            resume_failures: self.resume_failures.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }

    fn set_phase(&self, phase: WatchPhase) {
        let mut current = self.phase.write();
        if *current != phase {
            tracing::debug!(
                kind = %self.kind,
                from = ?*current,
                to = ?phase,
                "watch phase change"
            );
            *current = phase;
        }
    }

    fn advance(&self, revision: u64) {
        self.last_applied.fetch_max(revision, Ordering::AcqRel);
    }

    fn reset_to(&self, revision: u64) {
        self.last_applied.store(revision, Ordering::Release);
        self.relists.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, error: &TrellisError) {
        *self.last_error.write() = Some(error.to_string());
    }
}

enum StreamEnd {
    Shutdown,
    Failed(TrellisError),
}

/// Watch loop for one kind.
#[derive(Debug)]
pub struct WatchLoop {
    kind: ResourceKind,
    client: KvClient,
    cache: Arc<Cache>,
    session: Arc<WatchSession>,
    config: WatchConfig,
}

impl WatchLoop {
    pub fn new(
        client: KvClient,
        cache: Arc<Cache>,
        session: Arc<WatchSession>,
        config: WatchConfig,
    ) -> Self {
        Self {
            kind: cache.kind(),
            client,
            cache,
            session,
            config,
        }
    }

    pub fn session(&self) -> &Arc<WatchSession> {
        &self.session
    }

    /// Perform the first listing. Startup fails if this fails.
    pub async fn initial_sync(&self) -> TrellisResult<()> {
        self.session.set_phase(WatchPhase::Listing);
        match self.relist().await {
            Ok(()) => {
                self.session.set_phase(WatchPhase::Streaming);
                Ok(())
            }
            Err(e) => {
                self.session.record_error(&e);
                self.session.set_phase(WatchPhase::Erroring);
                Err(e)
            }
        }
    }

    async fn relist(&self) -> TrellisResult<()> {
        let listing = self
            .attempt("list", self.client.list(self.kind))
            .await?;
        let count = listing.kvs.len();
        self.cache.replace_all(listing.kvs, listing.revision);
        self.session.reset_to(self.cache.floor());
        tracing::info!(
            kind = %self.kind,
            revision = listing.revision,
            count,
            "cache listed"
        );
        Ok(())
    }

    async fn attempt<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = TrellisResult<T>>,
    ) -> TrellisResult<T> {
        let deadline = self.config.retry_timeout();
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(TrellisError::unavailable(format!(
                "{} for {} timed out after {}ms",
                op,
                self.kind,
                deadline.as_millis()
            ))),
        }
    }

    fn apply(&self, events: Vec<WatchEvent>) {
        let mut applied = 0u64;
        for event in events {
            let changed = match event.event_type {
                EventType::Put => match event.value {
                    Some(value) => self.cache.apply_put(&event.key, value, event.revision),
                    None => false,
                },
                EventType::Delete => self.cache.apply_delete(&event.key, event.revision),
            };
            if changed {
                applied += 1;
            }
            self.session.advance(event.revision);
        }
        self.cache.advance_floor(self.session.last_applied_revision());
        self.session
            .events_applied
            .fetch_add(applied, Ordering::Relaxed);
        tracing::trace!(
            kind = %self.kind,
            applied,
            revision = self.session.last_applied_revision(),
            "watch batch applied"
        );
    }

    fn fail(&self, error: &TrellisError) {
        self.session.record_error(error);
        self.session.set_phase(WatchPhase::Erroring);
        tracing::warn!(kind = %self.kind, error = %error, "watch loop error");
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff_initial(), self.config.backoff_max());
        let mut resume_failures: u32 = 0;
        let mut needs_relist = self.session.phase() != WatchPhase::Streaming;

        tracing::debug!(kind = %self.kind, "watch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if needs_relist {
                self.session.set_phase(WatchPhase::Listing);
                let listed = tokio::select! {
                    result = self.relist() => result,
                    _ = shutdown.changed() => break,
                };
                match listed {
                    Ok(()) => {
                        needs_relist = false;
                        resume_failures = 0;
                        backoff.reset();
                    }
                    Err(e) => {
                        self.fail(&e);
                        if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let start = self.session.resume_revision();
            let opened = tokio::select! {
                result = self.attempt("watch", self.client.watch(self.kind, start)) => result,
                _ = shutdown.changed() => break,
            };

            let end = match opened {
                Ok(mut stream) => {
                    self.session.set_phase(WatchPhase::Streaming);
                    tracing::debug!(kind = %self.kind, start, "watch subscribed");
                    self.consume(&mut stream, &mut shutdown, &mut backoff, &mut resume_failures)
                        .await
                }
                Err(e) => StreamEnd::Failed(e),
            };

            let error = match end {
                StreamEnd::Shutdown => break,
                StreamEnd::Failed(error) => error,
            };

            self.fail(&error);
            if error.requires_relist() {
                tracing::info!(kind = %self.kind, "watch history compacted; relisting");
                needs_relist = true;
                continue;
            }

            resume_failures += 1;
            self.session.resume_failures.fetch_add(1, Ordering::Relaxed);
            if resume_failures >= self.config.max_resume_failures {
                tracing::info!(
                    kind = %self.kind,
                    failures = resume_failures,
                    "resume attempts exhausted; relisting"
                );
                needs_relist = true;
            }
            if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                break;
            }
        }

        self.session.set_phase(WatchPhase::Closed);
        tracing::debug!(kind = %self.kind, "watch loop stopped");
    }

    async fn consume(
        &self,
        stream: &mut WatchStream,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
        resume_failures: &mut u32,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Shutdown,
                item = stream.next() => match item {
                    Some(Ok(events)) => {
                        self.apply(events);
                        backoff.reset();
                        *resume_failures = 0;
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => {
                        return StreamEnd::Failed(TrellisError::unavailable("watch stream ended"))
                    }
                },
            }
        }
    }
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
