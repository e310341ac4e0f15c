//! Revisioned key-value core.
//!
//! # Modules
//!
//! - [`record`] - Key-value records and change events
//! - [`revision`] - Revision clock and in-order commit publication
//! - [`locks`] - Per-key critical sections
//! - [`watch`] - Watch hub with bounded per-subscription queues
//! - [`store`] - Put, delete, and get orchestration
//!
//! # Invariants
//!
//! - Every committed mutation consumes exactly one revision; revisions
//!   only grow.
//! - Mutations to one key are serialized; versions never skip or repeat.
//! - The watch hub receives events in strictly increasing revision order.
//! - A failed backend write publishes nothing.

pub mod locks;
pub mod record;
pub mod revision;
pub mod store;
pub mod watch;

pub use record::{EventType, KeyValue, KvEvent};
pub use revision::{Revision, RevisionClock, RevisionTicket};
pub use store::{Deleted, PutOutcome, PutValue, Store, StoreStats};
pub use watch::{
    KeyRange, MissedEvents, Subscription, SubscriptionId, SubscriptionSpec, WatchFilters,
    WatchHub, WatchHubStats,
};
