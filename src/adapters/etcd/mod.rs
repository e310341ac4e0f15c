//! etcd v3 gRPC adapter.
//!
//! Exposes the store through the subset of etcd's API that maps onto
//! single-object storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                etcd v3 gRPC                 │
//! ├──────────────────────┬──────────────────────┤
//! │       KV API         │      Watch API       │
//! │  Range (point get)   │   Create / Cancel    │
//! │  Put                 │   Progress           │
//! │  DeleteRange (key)   │                      │
//! └──────────────────────┴──────────────────────┘
//!                        │
//! ┌─────────────────────────────────────────────┐
//! │        Store (locks, clock, watch hub)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Key Behaviors
//!
//! - Mutation responses carry the mutation's own revision; reads carry
//!   the committed revision
//! - Range scans, historical reads, leases, and transactions are refused
//! - A watcher that falls behind is canceled with a resync reason instead
//!   of silently losing events
//!
//! # Modules
//!
//! - [`grpc`] - tonic service wrappers, shared state, and the server
//! - [`kv`] - Range, Put, and DeleteRange handling
//! - [`watch`] - Watch stream sessions and event relays
//! - [`proto`] - Wire messages
//! - [`errors`] - Error mapping to gRPC status codes

pub mod errors;
pub mod grpc;
pub mod kv;
pub mod proto;
pub mod watch;

pub use grpc::{EtcdGrpcServer, EtcdKvServer, EtcdWatchServer, SharedState};
pub use kv::KvService;
pub use watch::{WatchResponseStream, WatchService};
