//! Error types.
//!
//! Every failure the store can surface falls into one of four classes:
//! absent keys, malformed input, backend unavailability, and internal
//! (serialization) faults. The etcd adapter maps each class onto a gRPC
//! status code in [`crate::adapters::etcd::errors`].

use thiserror::Error;

/// Common blobkv error conditions.
#[derive(Debug, Error)]
pub enum BlobKvError {
    /// Lookup or mutation of an absent key.
    #[error("key not found")]
    KeyNotFound,

    /// Request is malformed or asks for an unsupported feature.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Blob connection descriptor is malformed, uses an unsupported scheme,
    /// or lacks a bucket segment.
    #[error("invalid blob url: {message}")]
    InvalidUrl { message: String },

    /// Object backend could not be reached or refused the operation.
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    /// Stored value could not be encoded or decoded, or a task failed.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// A watch with this identifier is already active on the stream.
    #[error("watch id {watch_id} already exists")]
    WatchIdExists { watch_id: i64 },
}

impl BlobKvError {
    /// Create an InvalidRequest error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an InvalidUrl error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            message: message.into(),
        }
    }

    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the caller may retry the operation.
    ///
    /// The store itself never retries; this only classifies.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Check if this error reports an absent key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }
}

impl From<serde_json::Error> for BlobKvError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("stored value codec: {}", err))
    }
}

/// Result type using BlobKvError.
pub type BlobKvResult<T> = Result<T, BlobKvError>;
