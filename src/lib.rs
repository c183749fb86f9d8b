//! Trellis - cached persistence core for a gateway configuration manager.
//!
//! Trellis keeps typed configuration resources (routes, services, upstreams,
//! consumers, and friends) in an etcd-style key-value store and serves reads
//! from in-memory caches that watch loops keep in sync with the store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           StoreHub                              │
//! │        kind → TypedStore (CRUD, list)      │     verify()       │
//! └─────────────────────────────────────────────────────────────────┘
//!                 │ reads                  │ writes
//! ┌───────────────────────────┐            │
//! │  Cache (per kind, RwLock) │◄── WatchLoop (list, then watch)     │
//! └───────────────────────────┘            │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     KvClient / KvBackend                        │
//! │            etcd v3 gRPC      │      in-process MVCC             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::time`] - Timestamps and flake ids
//! - [`core::backoff`] - Capped exponential backoff
//! - [`core::error`] - Error types
//!
//! ## Resources
//! - [`resource::kind`] - Resource kinds and key layout
//! - [`resource::codec`] - Stored byte format
//! - [`resource::validate`] - Pre-write validation
//!
//! ## Key-value store
//! - [`kv::client`] - Prefix-scoped client with deadlines
//! - [`kv::memory`] - In-process backend
//! - `kv::etcd` - etcd v3 backend (feature `grpc`)
//!
//! ## Store
//! - [`store::cache`] - Per-kind caches
//! - [`store::typed`] - Typed CRUD
//! - [`store::watch`] - Watch loops
//! - [`store::hub`] - Store registry
//! - [`store::verify`] - Consistency verifier
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - A cache entry never moves to an older revision, deletes included.
//! - Once writes stop and the store is reachable, every cache converges to
//!   the store's contents.
//! - `create_time` never changes after creation; `update_time` strictly
//!   increases on every update.

// Core infrastructure
pub mod core;

// Resource model
pub mod resource;

// Key-value store access
pub mod kv;

// Cached stores
pub mod store;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use error::{TrellisError, TrellisResult};
pub use resource::{Resource, ResourceKind};
pub use store::{verify, StoreHub, TypedStore};
