//! Store, revision, and watch hub integration tests.

mod common;

use blobkv::core::error::BlobKvError;
use blobkv::kv::{EventType, KeyRange, KeyValue, Store, SubscriptionSpec, WatchFilters};
use common::{assert_no_event, faulty_store, memory_store, next_event};
use std::collections::HashSet;
use std::time::Duration;

// ============================================================================
// Put / Get / Delete
// ============================================================================

#[tokio::test]
async fn put_get_delete_lifecycle() {
    let (store, backend) = memory_store(16);
    store.init().await.unwrap();
    assert!(backend.bucket_exists());

    store.put("foo", "bar").await.unwrap();
    let kv = store.get("foo").await.unwrap();
    assert_eq!(
        kv,
        KeyValue {
            key: "foo".to_string(),
            value: b"bar".to_vec(),
            create_revision: 1,
            mod_revision: 1,
            version: 1,
            lease: 0,
        }
    );

    store.put("foo", "baz").await.unwrap();
    let kv = store.get("foo").await.unwrap();
    assert_eq!(kv.value, b"baz");
    assert_eq!(kv.version, 2);
    assert_eq!(kv.create_revision, 1);
    assert_eq!(kv.mod_revision, 2);

    let deleted = store.delete("foo").await.unwrap().unwrap();
    assert_eq!(deleted.revision, 3);
    assert_eq!(deleted.prev_kv.value, b"baz");
    assert!(matches!(store.get("foo").await, Err(BlobKvError::KeyNotFound)));
    assert_eq!(backend.object_count(), 0);
}

#[tokio::test]
async fn recreated_key_starts_over() {
    let (store, _backend) = memory_store(16);
    store.put("foo", "one").await.unwrap();
    store.put("foo", "two").await.unwrap();
    store.delete("foo").await.unwrap();

    let outcome = store.put("foo", "three").await.unwrap();
    assert!(outcome.prev_kv.is_none());
    assert_eq!(outcome.kv.version, 1);
    assert_eq!(outcome.kv.create_revision, 4);
    assert_eq!(outcome.kv.mod_revision, 4);
}

#[tokio::test]
async fn delete_absent_key_is_noop() {
    let (store, backend) = memory_store(16);
    store.put("other", "x").await.unwrap();

    assert!(store.delete("missing").await.unwrap().is_none());
    assert_eq!(store.revision(), 1);
    assert_eq!(backend.write_count(), 1);

    let outcome = store.put("other", "y").await.unwrap();
    assert_eq!(outcome.revision(), 2);
}

#[tokio::test]
async fn empty_key_rejected() {
    let (store, _backend) = memory_store(16);
    assert!(matches!(
        store.put("", "x").await,
        Err(BlobKvError::InvalidRequest { .. })
    ));
    assert!(store.delete("").await.is_err());
    assert!(store.get("").await.is_err());
    assert_eq!(store.revision(), 0);
}

#[tokio::test]
async fn revisions_strictly_increase_across_keys() {
    let (store, _backend) = memory_store(16);
    let mut last = 0;
    for i in 0..20 {
        let key = format!("key-{}", i % 3);
        let revision = if i % 5 == 4 {
            match store.delete(key.as_str()).await.unwrap() {
                Some(deleted) => deleted.revision,
                None => continue,
            }
        } else {
            store.put(key, format!("v{}", i)).await.unwrap().revision()
        };
        assert!(revision > last, "revision {} after {}", revision, last);
        last = revision;
    }
    assert_eq!(store.revision(), last);
}

#[tokio::test]
async fn concurrent_puts_produce_consecutive_versions() {
    const WRITERS: i64 = 32;
    let (store, _backend) = memory_store(64);

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.put("counter", format!("w{}", i)).await })
        })
        .collect();

    let mut versions = Vec::new();
    let mut revisions = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        versions.push(outcome.kv.version);
        assert!(revisions.insert(outcome.revision()));
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=WRITERS).collect::<Vec<_>>());

    let kv = store.get("counter").await.unwrap();
    assert_eq!(kv.version, WRITERS);
    assert_eq!(kv.mod_revision, WRITERS);
}

#[tokio::test]
async fn two_concurrent_puts_never_share_a_version() {
    let (store, _backend) = memory_store(16);
    let (a, b) = tokio::join!(store.put("foo", "a"), store.put("foo", "b"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.kv.version, b.kv.version);
    assert_eq!(store.get("foo").await.unwrap().version, 2);
}

#[tokio::test]
async fn keep_value_put_bumps_version() {
    let (store, _backend) = memory_store(16);
    assert!(store
        .put("foo", blobkv::kv::PutValue::Keep)
        .await
        .unwrap_err()
        .is_not_found());

    store.put("foo", "bar").await.unwrap();
    let outcome = store.put("foo", blobkv::kv::PutValue::Keep).await.unwrap();
    assert_eq!(outcome.kv.value, b"bar");
    assert_eq!(outcome.kv.version, 2);
}

#[tokio::test]
async fn restarted_store_continues_after_stored_revisions() {
    let (store, backend) = memory_store(16);
    store.put("a", "1").await.unwrap();
    store.put("b", "1").await.unwrap();
    store.put("a", "2").await.unwrap();
    drop(store);

    let restarted = Store::new(backend, 16);
    let outcome = restarted.put("a", "3").await.unwrap();
    assert_eq!(outcome.kv.version, 3);
    assert!(outcome.revision() > 3);
    assert_eq!(outcome.kv.create_revision, 1);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn failed_write_publishes_nothing() {
    let (store, backend) = faulty_store(16);
    let mut sub = store
        .hub()
        .subscribe(SubscriptionSpec::new(KeyRange::prefix("k/")));

    backend.fail_writes("k/bad");
    let err = store.put("k/bad", "x").await.unwrap_err();
    assert!(err.is_retriable());
    assert!(matches!(store.get("k/bad").await, Err(BlobKvError::KeyNotFound)));
    assert_eq!(store.stats().failed_mutations, 1);

    let good = store.put("k/good", "y").await.unwrap();
    let event = next_event(&mut sub).await;
    assert_eq!(event.kv.key, "k/good");
    assert_eq!(event.revision(), good.revision());
    assert_no_event(&mut sub);
    assert_eq!(store.revision(), good.revision());

    backend.heal("k/bad");
    let healed = store.put("k/bad", "x").await.unwrap();
    assert_eq!(healed.kv.version, 1);
}

#[tokio::test]
async fn failed_delete_keeps_key() {
    let (store, backend) = faulty_store(16);
    store.put("foo", "bar").await.unwrap();

    backend.fail_writes("foo");
    assert!(store.delete("foo").await.is_err());
    assert_eq!(store.get("foo").await.unwrap().value, b"bar");
    assert!(backend.memory().raw("foo").is_some());
}

#[tokio::test]
async fn unavailable_backend_surfaces_error() {
    let (store, backend) = memory_store(16);
    backend.set_unavailable(true);
    assert!(matches!(
        store.put("foo", "bar").await,
        Err(BlobKvError::Unavailable { .. })
    ));
    assert!(store.init().await.is_err());

    backend.set_unavailable(false);
    assert_eq!(store.put("foo", "bar").await.unwrap().kv.version, 1);
}

#[tokio::test]
async fn corrupt_object_is_internal_error() {
    let (store, backend) = memory_store(16);
    backend.insert_raw("foo", "not json");
    assert!(matches!(
        store.get("foo").await,
        Err(BlobKvError::Internal { .. })
    ));
}

// ============================================================================
// Watch delivery
// ============================================================================

#[tokio::test]
async fn subscription_receives_put_event() {
    let (store, _backend) = memory_store(16);
    let mut sub = store.hub().subscribe(SubscriptionSpec::new(KeyRange::single("foo")));

    store.put("foo", "v1").await.unwrap();
    let event = next_event(&mut sub).await;
    assert_eq!(event.event_type, EventType::Put);
    assert_eq!(event.kv, KeyValue::created("foo", b"v1".to_vec(), 1));
    assert!(event.prev_kv.is_none());
    assert_no_event(&mut sub);
}

#[tokio::test]
async fn subscription_sees_only_later_mutations() {
    let (store, _backend) = memory_store(16);
    store.put("foo", "before").await.unwrap();

    let mut sub = store.hub().subscribe(SubscriptionSpec::new(KeyRange::single("foo")));
    assert_eq!(sub.revision, 1);
    assert_no_event(&mut sub);

    store.put("foo", "after").await.unwrap();
    store.delete("foo").await.unwrap();

    let put = next_event(&mut sub).await;
    assert_eq!(put.revision(), 2);
    assert_eq!(put.prev_kv.as_ref().unwrap().value, b"before");

    let delete = next_event(&mut sub).await;
    assert_eq!(delete.event_type, EventType::Delete);
    assert_eq!(delete.revision(), 3);
    assert_eq!(delete.kv.key, "foo");
    assert_eq!(delete.prev_kv.as_ref().unwrap().value, b"after");
}

#[tokio::test]
async fn events_arrive_in_revision_order_despite_slow_writes() {
    let (store, backend) = faulty_store(16);
    backend.delay_writes("k/slow", Duration::from_millis(200));
    let mut sub = store
        .hub()
        .subscribe(SubscriptionSpec::new(KeyRange::prefix("k/")));

    let slow = {
        let store = store.clone();
        tokio::spawn(async move { store.put("k/slow", "s").await })
    };
    // Let the slow writer take its revision first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = store.put("k/fast", "f").await.unwrap();
    let slow = slow.await.unwrap().unwrap();
    assert!(slow.revision() < fast.revision());

    let first = next_event(&mut sub).await;
    let second = next_event(&mut sub).await;
    assert_eq!(first.kv.key, "k/slow");
    assert_eq!(second.kv.key, "k/fast");
    assert_eq!(store.revision(), fast.revision());
}

#[tokio::test]
async fn acknowledged_put_is_already_published() {
    let (store, backend) = faulty_store(16);
    backend.delay_writes("k/slow", Duration::from_millis(300));

    let slow = {
        let store = store.clone();
        tokio::spawn(async move { store.put("k/slow", "s").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = {
        let store = store.clone();
        tokio::spawn(async move { store.put("k/fast", "f").await })
    };
    // The fast write is durable but waits behind the slow revision.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fast.is_finished());
    assert_eq!(store.revision(), 0);

    let fast = fast.await.unwrap().unwrap();
    assert!(store.revision() >= fast.revision());
    assert_eq!(store.hub().revision(), fast.revision());

    // A watch opened after the acknowledgement never sees the put.
    let mut later = store
        .hub()
        .subscribe(SubscriptionSpec::new(KeyRange::single("k/fast")));
    assert_eq!(later.revision, fast.revision());
    slow.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_no_event(&mut later);
}

#[tokio::test]
async fn read_of_acknowledged_key_waits_for_lower_revisions() {
    let (store, backend) = faulty_store(16);
    backend.delay_writes("k/slow", Duration::from_millis(200));

    let slow = {
        let store = store.clone();
        tokio::spawn(async move { store.put("k/slow", "s").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = {
        let store = store.clone();
        tokio::spawn(async move { store.put("k/fast", "f").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The read queues behind the fast put and so behind revision 1.
    let kv = store.get("k/fast").await.unwrap();
    assert_eq!(kv.mod_revision, 2);
    assert!(store.revision() >= 2);
    assert_eq!(slow.await.unwrap().unwrap().revision(), 1);
    fast.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_writers_publish_in_order() {
    let (store, _backend) = memory_store(256);
    let mut sub = store
        .hub()
        .subscribe(SubscriptionSpec::new(KeyRange::prefix("c/")));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.put(format!("c/{}", i % 7), "v").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut last = 0;
    for _ in 0..50 {
        let event = next_event(&mut sub).await;
        assert_eq!(event.revision(), last + 1);
        last = event.revision();
    }
    assert_no_event(&mut sub);
}

#[tokio::test]
async fn filters_and_ranges_select_events() {
    let (store, _backend) = memory_store(16);
    let hub = store.hub();
    let mut no_put = hub.subscribe(
        SubscriptionSpec::new(KeyRange::prefix("app/")).with_filters(WatchFilters::NOPUT),
    );
    let mut interval = hub.subscribe(SubscriptionSpec::new(KeyRange::new("b", "d")));

    store.put("app/x", "1").await.unwrap();
    store.put("a", "1").await.unwrap();
    store.put("c", "1").await.unwrap();
    store.put("d", "1").await.unwrap();
    store.delete("app/x").await.unwrap();

    let event = next_event(&mut no_put).await;
    assert_eq!(event.event_type, EventType::Delete);
    assert_eq!(event.kv.key, "app/x");
    assert_no_event(&mut no_put);

    let event = next_event(&mut interval).await;
    assert_eq!(event.kv.key, "c");
    assert_no_event(&mut interval);
}

#[tokio::test]
async fn unsubscribe_halts_delivery() {
    let (store, _backend) = memory_store(16);
    let hub = store.hub();
    let mut sub = hub.subscribe(SubscriptionSpec::new(KeyRange::single("foo")));

    store.put("foo", "1").await.unwrap();
    assert!(hub.unsubscribe(sub.id));
    assert!(!hub.unsubscribe(sub.id));
    store.put("foo", "2").await.unwrap();

    let event = next_event(&mut sub).await;
    assert_eq!(event.revision(), 1);
    // Queue closed: nothing published after removal reached it.
    assert!(sub.events.recv().await.is_none());
    assert!(hub.is_empty());
    assert_eq!(store.stats().watchers, 0);
}

#[tokio::test]
async fn overflow_drops_subscription_and_reports_missed_revision() {
    let (store, _backend) = memory_store(2);
    let mut slow = store.hub().subscribe(SubscriptionSpec::new(KeyRange::single("foo")));
    let mut other = store.hub().subscribe(SubscriptionSpec::new(KeyRange::single("bar")));

    for i in 0..4 {
        store.put("foo", format!("{}", i)).await.unwrap();
    }
    store.put("bar", "ok").await.unwrap();

    assert_eq!(next_event(&mut slow).await.revision(), 1);
    assert_eq!(next_event(&mut slow).await.revision(), 2);
    assert!(slow.events.recv().await.is_none());
    assert_eq!(slow.missed.get(), Some(3));

    // Other watchers and the mutation path are unaffected.
    assert_eq!(next_event(&mut other).await.revision(), 5);
    let stats = store.hub().stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.overflowed, 1);
}
