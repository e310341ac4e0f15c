//! Storage layer.
//!
//! Everything below the key state coordinator: the object backend
//! boundary, the stored object format, and the blob URL that locates a
//! bucket.
//!
//! # Modules
//!
//! - [`backend`] - Object backend trait and the in-memory backend
//! - [`codec`] - JSON object format for stored records
//! - [`url`] - `s3://` connection descriptor parsing
//! - `s3` - S3-compatible backend (feature `s3`)

pub mod backend;
pub mod codec;
#[cfg(feature = "s3")]
pub mod s3;
pub mod url;

pub use backend::{BackendFuture, MemoryBackend, ObjectBackend};
pub use url::BlobUrl;

#[cfg(feature = "s3")]
pub use s3::S3Backend;
