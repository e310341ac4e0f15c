//! Watch hub.
//!
//! Registry of live subscriptions. Every committed mutation is published
//! here once, in revision order, and copied onto the bounded queue of
//! each subscription whose key range and filters accept it.
//!
//! Publishing never blocks. A subscription whose queue is full is removed
//! on the spot and remembers the first revision it failed to receive;
//! the consumer drains what was queued and then sees the closed queue
//! together with that revision, so it can tell the client to resync.

use super::record::{EventType, KvEvent};
use super::revision::Revision;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Hub-assigned subscription identity.
pub type SubscriptionId = u64;

// ============================================================================
// Key ranges and filters
// ============================================================================

/// Set of keys a subscription watches.
///
/// Follows etcd conventions: an empty `range_end` means the single key,
/// `[0]` means every key `>= key`, anything else is the half-open
/// interval `[key, range_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// First key in the range.
    pub key: Vec<u8>,
    /// Exclusive end, or empty for a single key.
    pub range_end: Vec<u8>,
}

impl KeyRange {
    /// Range covering exactly `key`.
    pub fn single(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: Vec::new(),
        }
    }

    /// Range covering every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let key = prefix.into();
        let range_end = prefix_end(&key);
        Self { key, range_end }
    }

    /// Range from raw etcd fields.
    pub fn new(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: range_end.into(),
        }
    }

    /// Whether this range names exactly one key.
    pub fn is_single_key(&self) -> bool {
        self.range_end.is_empty()
    }

    /// Check if `key` falls inside the range.
    pub fn matches(&self, key: &[u8]) -> bool {
        if self.range_end.is_empty() {
            key == self.key.as_slice()
        } else if self.range_end == [0] {
            key >= self.key.as_slice()
        } else {
            key >= self.key.as_slice() && key < self.range_end.as_slice()
        }
    }
}

/// Smallest key greater than every key with the given prefix.
///
/// Returns `[0]` (all keys) when no such key exists, i.e. the prefix is
/// empty or consists solely of `0xff` bytes.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

bitflags::bitflags! {
    /// Event filters for a subscription.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFilters: u32 {
        /// Filter out PUT events.
        const NOPUT = 0b0000_0001;
        /// Filter out DELETE events.
        const NODELETE = 0b0000_0010;
    }
}

impl WatchFilters {
    /// Check if an event of this type passes the filters.
    pub fn allows(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::Put => !self.contains(Self::NOPUT),
            EventType::Delete => !self.contains(Self::NODELETE),
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// What a new subscription wants to see.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Watched keys.
    pub range: KeyRange,
    /// Event types to suppress.
    pub filters: WatchFilters,
}

impl SubscriptionSpec {
    /// Watch every event on `range`.
    pub fn new(range: KeyRange) -> Self {
        Self {
            range,
            filters: WatchFilters::empty(),
        }
    }

    /// Suppress the given event types.
    pub fn with_filters(mut self, filters: WatchFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Overflow marker shared between the hub and the consumer.
///
/// Holds the first revision the subscription failed to receive, or 0.
#[derive(Debug, Clone, Default)]
pub struct MissedEvents(Arc<AtomicI64>);

impl MissedEvents {
    /// First missed revision, if the subscription overflowed.
    pub fn get(&self) -> Option<Revision> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            rev => Some(rev),
        }
    }

    fn mark(&self, revision: Revision) {
        // Keep the earliest.
        let _ = self
            .0
            .compare_exchange(0, revision, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Consumer side of a registered subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Hub identity, used to unsubscribe.
    pub id: SubscriptionId,
    /// Ordered event queue. Closes on unsubscribe or overflow.
    pub events: mpsc::Receiver<Arc<KvEvent>>,
    /// Set when the hub dropped the subscription for overflowing.
    pub missed: MissedEvents,
    /// Last revision published before registration; every queued event
    /// is newer.
    pub revision: Revision,
}

struct SubscriptionEntry {
    spec: SubscriptionSpec,
    sender: mpsc::Sender<Arc<KvEvent>>,
    missed: MissedEvents,
}

#[derive(Default)]
struct HubState {
    next_id: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    /// Exact-key subscriptions indexed by key.
    by_key: HashMap<Vec<u8>, HashSet<SubscriptionId>>,
    /// Prefix and interval subscriptions, scanned on every publish.
    ranged: HashSet<SubscriptionId>,
    /// Revision of the last published event.
    revision: Revision,
}

impl HubState {
    fn remove(&mut self, id: SubscriptionId) -> Option<SubscriptionEntry> {
        let entry = self.subscriptions.remove(&id)?;
        if entry.spec.range.is_single_key() {
            if let Some(ids) = self.by_key.get_mut(&entry.spec.range.key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(&entry.spec.range.key);
                }
            }
        } else {
            self.ranged.remove(&id);
        }
        Some(entry)
    }

    fn candidates(&self, key: &[u8]) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .by_key
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.extend(self.ranged.iter().copied().filter(|id| {
            self.subscriptions
                .get(id)
                .is_some_and(|entry| entry.spec.range.matches(key))
        }));
        ids
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Snapshot of hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHubStats {
    /// Registered subscriptions.
    pub active: usize,
    /// Events enqueued across all subscriptions.
    pub delivered: u64,
    /// Subscriptions removed because their queue was full.
    pub overflowed: u64,
}

/// Registry of active subscriptions.
pub struct WatchHub {
    state: RwLock<HubState>,
    queue_capacity: usize,
    delivered: AtomicU64,
    overflowed: AtomicU64,
}

impl WatchHub {
    /// Create a hub whose subscriptions buffer up to `queue_capacity`
    /// events each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState {
                next_id: 1,
                ..HubState::default()
            }),
            queue_capacity: queue_capacity.max(1),
            delivered: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        }
    }

    /// Per-subscription queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Register interest in a key range.
    ///
    /// Events published after this returns are delivered; nothing
    /// published before is replayed.
    pub fn subscribe(&self, spec: SubscriptionSpec) -> Subscription {
        let (sender, events) = mpsc::channel(self.queue_capacity);
        let missed = MissedEvents::default();

        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;

        if spec.range.is_single_key() {
            state
                .by_key
                .entry(spec.range.key.clone())
                .or_default()
                .insert(id);
        } else {
            state.ranged.insert(id);
        }
        state.subscriptions.insert(
            id,
            SubscriptionEntry {
                spec,
                sender,
                missed: missed.clone(),
            },
        );

        debug!(subscription = id, "watch subscription registered");
        Subscription {
            id,
            events,
            missed,
            revision: state.revision,
        }
    }

    /// Remove a subscription. Closes its queue once drained.
    ///
    /// Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.state.write().remove(id).is_some();
        if removed {
            debug!(subscription = id, "watch subscription removed");
        }
        removed
    }

    /// Fan an event out to every matching subscription.
    ///
    /// Callers must publish in strictly increasing revision order.
    pub fn publish(&self, event: Arc<KvEvent>) {
        let revision = event.revision();
        let key = event.key().as_bytes();

        let mut state = self.state.write();
        debug_assert!(revision > state.revision);
        state.revision = revision;

        let mut dropped = Vec::new();
        for id in state.candidates(key) {
            let Some(entry) = state.subscriptions.get(&id) else {
                continue;
            };
            if !entry.spec.filters.allows(event.event_type) {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    entry.missed.mark(revision);
                    self.overflowed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = id,
                        revision,
                        capacity = self.queue_capacity,
                        "watch queue full, dropping subscription"
                    );
                    dropped.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = id, "watch consumer gone");
                    dropped.push(id);
                }
            }
        }

        for id in dropped {
            state.remove(id);
        }
    }

    /// Revision of the last published event.
    pub fn revision(&self) -> Revision {
        self.state.read().revision
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.state.read().subscriptions.len()
    }

    /// Check if no subscription is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a subscription is still registered.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.state.read().subscriptions.contains_key(&id)
    }

    /// Get counters.
    pub fn stats(&self) -> WatchHubStats {
        WatchHubStats {
            active: self.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHub")
            .field("queue_capacity", &self.queue_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::record::KeyValue;

    fn put(key: &str, rev: Revision) -> Arc<KvEvent> {
        Arc::new(KvEvent::put(
            KeyValue::created(key, b"v".to_vec(), rev),
            None,
        ))
    }

    fn delete(key: &str, rev: Revision) -> Arc<KvEvent> {
        let prev = KeyValue::created(key, b"v".to_vec(), rev - 1);
        Arc::new(KvEvent::delete(key, rev, prev))
    }

    #[test]
    fn test_key_range_matching() {
        let single = KeyRange::single("foo");
        assert!(single.matches(b"foo"));
        assert!(!single.matches(b"foo/bar"));

        let prefix = KeyRange::prefix("foo/");
        assert!(prefix.matches(b"foo/"));
        assert!(prefix.matches(b"foo/bar"));
        assert!(!prefix.matches(b"foo"));
        assert!(!prefix.matches(b"fop"));

        let from = KeyRange::new("m", vec![0u8]);
        assert!(from.matches(b"m"));
        assert!(from.matches(b"zzz"));
        assert!(!from.matches(b"a"));

        let interval = KeyRange::new("a", "c");
        assert!(interval.matches(b"b"));
        assert!(!interval.matches(b"c"));
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"foo"), b"fop");
        assert_eq!(prefix_end(b"a\xff"), b"b");
        assert_eq!(prefix_end(b"\xff\xff"), vec![0u8]);
        assert_eq!(prefix_end(b""), vec![0u8]);
    }

    #[test]
    fn test_filters() {
        assert!(WatchFilters::empty().allows(EventType::Put));
        assert!(!WatchFilters::NOPUT.allows(EventType::Put));
        assert!(WatchFilters::NOPUT.allows(EventType::Delete));
        assert!(!WatchFilters::NODELETE.allows(EventType::Delete));
    }

    #[test]
    fn test_publish_reaches_matching_subscriptions() {
        let hub = WatchHub::new(8);
        let mut exact = hub.subscribe(SubscriptionSpec::new(KeyRange::single("foo")));
        let mut prefix = hub.subscribe(SubscriptionSpec::new(KeyRange::prefix("fo")));
        let mut other = hub.subscribe(SubscriptionSpec::new(KeyRange::single("bar")));

        hub.publish(put("foo", 1));

        assert_eq!(exact.events.try_recv().unwrap().revision(), 1);
        assert_eq!(prefix.events.try_recv().unwrap().revision(), 1);
        assert!(other.events.try_recv().is_err());
        assert_eq!(hub.stats().delivered, 2);
        assert_eq!(hub.revision(), 1);
    }

    #[test]
    fn test_subscription_sees_only_later_events() {
        let hub = WatchHub::new(8);
        hub.publish(put("foo", 1));

        let mut sub = hub.subscribe(SubscriptionSpec::new(KeyRange::single("foo")));
        assert_eq!(sub.revision, 1);
        assert!(sub.events.try_recv().is_err());

        hub.publish(put("foo", 2));
        hub.publish(delete("foo", 3));
        assert_eq!(sub.events.try_recv().unwrap().revision(), 2);
        assert_eq!(sub.events.try_recv().unwrap().revision(), 3);
    }

    #[test]
    fn test_filtered_events_are_skipped() {
        let hub = WatchHub::new(8);
        let spec =
            SubscriptionSpec::new(KeyRange::single("foo")).with_filters(WatchFilters::NOPUT);
        let mut sub = hub.subscribe(spec);

        hub.publish(put("foo", 1));
        hub.publish(delete("foo", 2));

        let event = sub.events.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Delete);
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_closes_queue() {
        let hub = WatchHub::new(8);
        let mut sub = hub.subscribe(SubscriptionSpec::new(KeyRange::single("foo")));

        assert!(hub.unsubscribe(sub.id));
        assert!(!hub.unsubscribe(sub.id));
        assert!(hub.is_empty());

        hub.publish(put("foo", 1));
        assert!(matches!(
            sub.events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_overflow_drops_subscription_and_records_revision() {
        let hub = WatchHub::new(2);
        let mut sub = hub.subscribe(SubscriptionSpec::new(KeyRange::prefix("k")));

        hub.publish(put("k1", 1));
        hub.publish(put("k2", 2));
        hub.publish(put("k3", 3));
        hub.publish(put("k4", 4));

        assert!(!hub.contains(sub.id));
        assert_eq!(sub.missed.get(), Some(3));
        assert_eq!(hub.stats().overflowed, 1);

        // Queued events survive; then the queue reports closed.
        assert_eq!(sub.events.try_recv().unwrap().revision(), 1);
        assert_eq!(sub.events.try_recv().unwrap().revision(), 2);
        assert!(matches!(
            sub.events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_dropped_consumer_is_cleaned_up() {
        let hub = WatchHub::new(4);
        let sub = hub.subscribe(SubscriptionSpec::new(KeyRange::single("foo")));
        drop(sub);

        hub.publish(put("foo", 1));
        assert!(hub.is_empty());
        assert_eq!(hub.stats().overflowed, 0);
    }
}
