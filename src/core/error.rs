//! Error types shared by the store, cache, and verifier.
//!
//! CRUD and verifier operations surface these directly to their callers.
//! The watch loop consumes them internally and never propagates.

use thiserror::Error;

/// Common Trellis error conditions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrellisError {
    /// The referenced resource is absent from the authoritative store.
    #[error("key: {key} is not found")]
    NotFound { key: String },

    /// A create collided with an existing key.
    #[error("key: {key} is conflicted")]
    AlreadyExists { key: String },

    /// Structural or referential validation failed.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The authoritative store could not be reached or timed out.
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A watch was asked to resume from a revision the store no longer has.
    #[error("revision {requested} has been compacted; compact revision is {compact_revision}")]
    StreamCompacted {
        requested: u64,
        compact_revision: u64,
    },

    /// A conditional write did not hold at the store.
    #[error("precondition failed for key: {key}")]
    PreconditionFailed { key: String },

    /// Stored bytes could not be decoded, or a resource could not be encoded.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// The resource type is not registered with the hub.
    #[error("unknown resource type: {name}")]
    UnknownResourceType { name: String },
}

impl TrellisError {
    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Create a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a StoreUnavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create a Codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Check if the error means the watch history is gone and a relist is required.
    pub fn requires_relist(&self) -> bool {
        matches!(self, Self::StreamCompacted { .. })
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(e: serde_json::Error) -> Self {
        Self::codec(e.to_string())
    }
}

/// Result type using TrellisError.
pub type TrellisResult<T> = Result<T, TrellisError>;

/// HTTP status classes for the admin API layer that sits on top of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    BadRequest = 400,
    NotFound = 404,
    Conflict = 409,
    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl TrellisError {
    /// Map this error to the status an HTTP handler should answer with.
    pub fn http_status(&self) -> HttpStatus {
        match self {
            Self::NotFound { .. } => HttpStatus::NotFound,
            Self::AlreadyExists { .. } | Self::PreconditionFailed { .. } => HttpStatus::Conflict,
            Self::Validation { .. } | Self::UnknownResourceType { .. } => HttpStatus::BadRequest,
            Self::StoreUnavailable { .. } | Self::StreamCompacted { .. } => {
                HttpStatus::ServiceUnavailable
            }
            Self::Codec { .. } => HttpStatus::InternalServerError,
        }
    }
}
