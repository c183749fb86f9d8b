//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Trellis:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`time`] - Timestamps and id generation
//! - [`backoff`] - Reconnect backoff
//! - [`error`] - Error types and HTTP status mapping

pub mod backoff;
pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
