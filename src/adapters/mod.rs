//! Protocol adapters.
//!
//! Adapters translate an external wire protocol into [`crate::kv::Store`]
//! operations. One adapter exists today:
//!
//! - [`etcd`] - etcd v3 gRPC (KV and Watch services)

pub mod etcd;
