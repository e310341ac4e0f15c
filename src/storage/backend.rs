//! Object backend interface.
//!
//! The backend offers single-object get/put/delete and bucket bootstrap,
//! nothing more: no compare-and-swap, no listing, no retries. Consistency
//! for read-modify-write sequences is provided above this layer by
//! [`crate::kv::locks::KeyLocks`].

use crate::core::error::{BlobKvError, BlobKvResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BlobKvResult<T>> + Send + 'a>>;

/// Boundary to the remote object store.
///
/// Every failure is reported as [`BlobKvError::Unavailable`], except an
/// absent object which is `Ok(None)` from `get` and
/// [`BlobKvError::KeyNotFound`] from `delete` when the backend can tell.
pub trait ObjectBackend: Send + Sync {
    /// Short backend name for logs (e.g., "s3", "memory").
    fn name(&self) -> &'static str;

    /// Create the bucket if it does not exist.
    ///
    /// Returns `true` if the bucket was created by this call.
    fn ensure_bucket(&self) -> BackendFuture<'_, bool>;

    /// Fetch an object body.
    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<Bytes>>;

    /// Store an object body, replacing any previous one.
    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> BackendFuture<'a, ()>;

    /// Remove an object.
    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()>;
}

/// In-process backend holding objects in a map.
///
/// Used by tests and local experiments. Fault injection makes every
/// operation, or only puts and deletes, fail with `Unavailable` while
/// enabled.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, Bytes>>,
    bucket_exists: AtomicBool,
    unavailable: AtomicBool,
    read_only: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend with no bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make puts and deletes fail while reads keep working.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether `ensure_bucket` has run.
    pub fn bucket_exists(&self) -> bool {
        self.bucket_exists.load(Ordering::SeqCst)
    }

    /// Number of successful puts and deletes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read an object body directly, bypassing fault injection.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).cloned()
    }

    /// Store an object body directly, bypassing fault injection.
    pub fn insert_raw(&self, key: &str, body: impl Into<Bytes>) {
        self.objects.write().insert(key.to_string(), body.into());
    }

    fn check_available(&self, op: &str) -> BlobKvResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BlobKvError::unavailable(format!(
                "{}: memory backend offline",
                op
            )))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self, op: &str) -> BlobKvResult<()> {
        self.check_available(op)?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(BlobKvError::unavailable(format!(
                "{}: memory backend is read-only",
                op
            )));
        }
        Ok(())
    }
}

impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ensure_bucket(&self) -> BackendFuture<'_, bool> {
        Box::pin(async move {
            self.check_available("ensure bucket")?;
            Ok(!self.bucket_exists.swap(true, Ordering::SeqCst))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            self.check_available("get object")?;
            Ok(self.objects.read().get(key).cloned())
        })
    }

    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable("put object")?;
            self.objects.write().insert(key.to_string(), body);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable("delete object")?;
            match self.objects.write().remove(key) {
                Some(_) => {
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                None => Err(BlobKvError::KeyNotFound),
            }
        })
    }
}
