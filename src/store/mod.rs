//! Cached, typed access to the configuration store.
//!
//! - [`cache`] - Revision-idempotent per-kind caches
//! - [`typed`] - CRUD and listing for one kind
//! - [`watch`] - Background list/watch synchronisation
//! - [`hub`] - Registry of stores keyed by kind
//! - [`verify`] - Cache versus store consistency report

pub mod cache;
pub mod hub;
pub mod typed;
pub mod verify;
pub mod watch;

pub use cache::{Cache, CacheEntry, CacheSet};
pub use hub::StoreHub;
pub use typed::{default_order, ListOutput, ListQuery, TypedStore};
pub use verify::{verify, InconsistentPair, KindReport, VerificationReport};
pub use watch::{WatchLoop, WatchPhase, WatchSession, WatchStatus};
