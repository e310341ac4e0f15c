//! Key state coordinator.
//!
//! [`Store`] ties the pieces together: per-key locks, the revision clock,
//! the object backend, and the watch hub. Every mutation follows the same
//! shape:
//!
//! ```text
//! lock(key) -> load -> next revision -> write object -> commit | abort
//!          -> wait for the watermark to reach the revision -> unlock
//! ```
//!
//! A failed backend write aborts the ticket, so no event is published and
//! the revision is skipped. A committed mutation returns only after its
//! event reached the watch hub, so a watch opened after the acknowledgement
//! never sees it. The key stays locked until then, which keeps reads of the
//! key from getting ahead of lower revisions still in flight. Mutations run on their own task so that a
//! client hanging up mid-request cannot interrupt the sequence between
//! the object write and the commit.

use super::locks::KeyLocks;
use super::record::{KeyValue, KvEvent};
use super::revision::{Revision, RevisionClock};
use super::watch::WatchHub;
use crate::core::error::{BlobKvError, BlobKvResult};
use crate::storage::backend::ObjectBackend;
use crate::storage::codec;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// New value for a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutValue {
    /// Replace the value.
    Replace(Vec<u8>),
    /// Keep the current value and only bump revision and version.
    /// The key must exist.
    Keep,
}

impl From<Vec<u8>> for PutValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Replace(value)
    }
}

impl From<&[u8]> for PutValue {
    fn from(value: &[u8]) -> Self {
        Self::Replace(value.to_vec())
    }
}

impl From<&str> for PutValue {
    fn from(value: &str) -> Self {
        Self::Replace(value.as_bytes().to_vec())
    }
}

impl From<String> for PutValue {
    fn from(value: String) -> Self {
        Self::Replace(value.into_bytes())
    }
}

/// Result of a committed put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Record as written.
    pub kv: KeyValue,
    /// Record it replaced.
    pub prev_kv: Option<KeyValue>,
}

impl PutOutcome {
    /// Revision consumed by the put.
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

/// Result of a committed delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deleted {
    /// Revision consumed by the delete.
    pub revision: Revision,
    /// Record that was removed.
    pub prev_kv: KeyValue,
}

/// Snapshot of store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Committed puts.
    pub puts: u64,
    /// Committed deletes.
    pub deletes: u64,
    /// Mutations aborted by a backend or codec failure.
    pub failed_mutations: u64,
    /// Last revision handed out.
    pub revision: Revision,
    /// Committed watermark.
    pub committed: Revision,
    /// Keys currently locked.
    pub locked_keys: usize,
    /// Registered watch subscriptions.
    pub watchers: usize,
}

struct StoreInner {
    backend: Arc<dyn ObjectBackend>,
    locks: Arc<KeyLocks>,
    clock: Arc<RevisionClock>,
    hub: Arc<WatchHub>,
    puts: AtomicU64,
    deletes: AtomicU64,
    failed: AtomicU64,
}

/// Revisioned key-value store over an object backend.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store whose watch subscriptions buffer `queue_capacity`
    /// events each.
    pub fn new(backend: Arc<dyn ObjectBackend>, queue_capacity: usize) -> Self {
        let hub = Arc::new(WatchHub::new(queue_capacity));
        let clock = Arc::new(RevisionClock::new(Arc::clone(&hub)));
        Self {
            inner: Arc::new(StoreInner {
                backend,
                locks: Arc::new(KeyLocks::new()),
                clock,
                hub,
                puts: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Make sure the bucket exists. Returns `true` if it was created.
    pub async fn init(&self) -> BlobKvResult<bool> {
        let created = self.inner.backend.ensure_bucket().await?;
        debug!(
            backend = self.inner.backend.name(),
            created, "bucket ready"
        );
        Ok(created)
    }

    /// Read the current record for `key`.
    pub async fn get(&self, key: &str) -> BlobKvResult<KeyValue> {
        check_key(key)?;
        let _guard = self.inner.locks.lock(key).await;
        self.inner.load(key).await?.ok_or(BlobKvError::KeyNotFound)
    }

    /// Create or update `key`.
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<PutValue>,
    ) -> BlobKvResult<PutOutcome> {
        let key = key.into();
        check_key(&key)?;
        let value = value.into();
        let inner = Arc::clone(&self.inner);
        detached(async move { inner.put(key, value).await }).await
    }

    /// Remove `key`.
    ///
    /// Returns `None` without consuming a revision if the key is absent.
    pub async fn delete(&self, key: impl Into<String>) -> BlobKvResult<Option<Deleted>> {
        let key = key.into();
        check_key(&key)?;
        let inner = Arc::clone(&self.inner);
        detached(async move { inner.delete(key).await }).await
    }

    /// Committed watermark, used for response headers.
    pub fn revision(&self) -> Revision {
        self.inner.clock.committed()
    }

    /// Revision clock.
    pub fn clock(&self) -> &Arc<RevisionClock> {
        &self.inner.clock
    }

    /// Watch hub fed by this store.
    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.inner.hub
    }

    /// Backend name for logs.
    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Get counters.
    pub fn stats(&self) -> StoreStats {
        let clock = self.inner.clock.stats();
        StoreStats {
            puts: self.inner.puts.load(Ordering::Relaxed),
            deletes: self.inner.deletes.load(Ordering::Relaxed),
            failed_mutations: self.inner.failed.load(Ordering::Relaxed),
            revision: clock.current,
            committed: clock.committed,
            locked_keys: self.inner.locks.len(),
            watchers: self.inner.hub.len(),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.inner.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl StoreInner {
    /// Fetch and decode a record. Caller holds the key lock.
    async fn load(&self, key: &str) -> BlobKvResult<Option<KeyValue>> {
        let Some(body) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let kv = codec::decode(&body)?;
        self.clock.witness(kv.mod_revision);
        Ok(Some(kv))
    }

    async fn put(&self, key: String, value: PutValue) -> BlobKvResult<PutOutcome> {
        let _guard = self.locks.lock(&key).await;
        let prev = self.load(&key).await?;

        let value = match (value, &prev) {
            (PutValue::Replace(value), _) => value,
            (PutValue::Keep, Some(prev)) => prev.value.clone(),
            (PutValue::Keep, None) => return Err(BlobKvError::KeyNotFound),
        };

        let ticket = self.clock.next();
        let revision = ticket.revision();
        let kv = match &prev {
            Some(prev) => prev.successor(value, revision),
            None => KeyValue::created(key.as_str(), value, revision),
        };

        let written = match codec::encode(&kv) {
            Ok(body) => self.backend.put(&key, body).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            ticket.abort();
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, revision, error = %err, "put aborted");
            return Err(err);
        }

        ticket.commit(KvEvent::put(kv.clone(), prev.clone()));
        self.clock.wait_committed(revision).await;
        self.puts.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, revision, version = kv.version, "put committed");
        Ok(PutOutcome { kv, prev_kv: prev })
    }

    async fn delete(&self, key: String) -> BlobKvResult<Option<Deleted>> {
        let _guard = self.locks.lock(&key).await;
        let Some(prev) = self.load(&key).await? else {
            debug!(key = %key, "delete of absent key");
            return Ok(None);
        };

        let ticket = self.clock.next();
        let revision = ticket.revision();
        match self.backend.delete(&key).await {
            Ok(()) | Err(BlobKvError::KeyNotFound) => {}
            Err(err) => {
                ticket.abort();
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, revision, error = %err, "delete aborted");
                return Err(err);
            }
        }

        ticket.commit(KvEvent::delete(key.as_str(), revision, prev.clone()));
        self.clock.wait_committed(revision).await;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, revision, "delete committed");
        Ok(Some(Deleted {
            revision,
            prev_kv: prev,
        }))
    }
}

fn check_key(key: &str) -> BlobKvResult<()> {
    if key.is_empty() {
        return Err(BlobKvError::invalid_request("key is not provided"));
    }
    Ok(())
}

/// Run a mutation to completion even if the caller goes away.
async fn detached<T, F>(mutation: F) -> BlobKvResult<T>
where
    F: Future<Output = BlobKvResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(mutation)
        .await
        .map_err(|e| BlobKvError::internal(format!("mutation task failed: {}", e)))?
}
