//! blobkv - an etcd v3 KV and Watch facade over S3-compatible blob storage.
//!
//! Every key is one object in a single bucket. A process-wide revision
//! clock stamps each mutation, per-key locks serialize writers of the same
//! key, and committed changes fan out to watch streams in revision order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     etcd v3 gRPC clients                        │
//! │            etcdserverpb.KV        │     etcdserverpb.Watch       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     adapters::etcd                              │
//! │   KvService (Range/Put/DeleteRange) │ WatchService (sessions)   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           kv::Store                             │
//! │    KeyLocks │ RevisionClock (commit sequencer) │ WatchHub        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      storage::ObjectBackend                     │
//! │           S3Backend (MinIO, S3) │ MemoryBackend (tests)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Component lifecycle and shutdown
//! - [`core::error`] - Error types
//!
//! ## KV
//! - [`kv::record`] - KeyValue records and change events
//! - [`kv::revision`] - Revision clock and commit sequencing
//! - [`kv::locks`] - Per-key mutual exclusion
//! - [`kv::watch`] - Watch hub and subscriptions
//! - [`kv::store`] - Get/Put/Delete orchestration
//!
//! ## Storage
//! - [`storage::url`] - Blob connection URLs
//! - [`storage::backend`] - Object backend trait and in-memory backend
//! - [`storage::codec`] - Stored object format
//!
//! ## Adapters
//! - [`adapters::etcd`] - etcd v3 gRPC adapter
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Revisions are strictly increasing and never reused for a stored change.
//! - A key's `version` counts its updates since creation, starting at 1.
//! - Watchers see changes in revision order, or an explicit lagged signal.

// Core infrastructure
pub mod core;

// KV semantics
pub mod kv;

// Object storage
pub mod storage;

// Protocol adapters
pub mod adapters;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use adapters::etcd;
pub use kv::{KeyValue, Revision, Store};
