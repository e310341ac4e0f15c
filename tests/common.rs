//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use blobkv::core::error::{BlobKvError, BlobKvResult};
use blobkv::kv::{KvEvent, Store, Subscription};
use blobkv::storage::{BackendFuture, MemoryBackend, ObjectBackend};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// How long a test waits for an event before giving up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Blob URI accepted by configuration validation.
pub const TEST_BLOB_URI: &str = "s3://minio:minio123@localhost:9000/blobkv-test";

/// Create a configuration file with the given content.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Store over a fresh in-memory backend.
pub fn memory_store(queue_capacity: usize) -> (Store, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (Store::new(backend.clone(), queue_capacity), backend)
}

/// Store over a fault-injecting backend.
pub fn faulty_store(queue_capacity: usize) -> (Store, Arc<FaultyBackend>) {
    let backend = Arc::new(FaultyBackend::new());
    (Store::new(backend.clone(), queue_capacity), backend)
}

/// Next event on a subscription, failing the test after [`EVENT_TIMEOUT`].
pub async fn next_event(subscription: &mut Subscription) -> Arc<KvEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, subscription.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

/// Assert that nothing is queued on a subscription right now.
pub fn assert_no_event(subscription: &mut Subscription) {
    if let Ok(event) = subscription.events.try_recv() {
        panic!("unexpected event: {:?}", event);
    }
}

/// Backend wrapper that fails or delays writes for chosen keys.
#[derive(Debug, Default)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    failing: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Underlying in-memory objects.
    pub fn memory(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Fail writes and deletes of `key` with `Unavailable`.
    pub fn fail_writes(&self, key: &str) {
        self.failing.lock().push(key.to_string());
    }

    /// Let writes of `key` succeed again.
    pub fn heal(&self, key: &str) {
        self.failing.lock().retain(|k| k != key);
    }

    /// Hold writes of `key` for `delay` before applying them.
    pub fn delay_writes(&self, key: &str, delay: Duration) {
        self.delays.lock().insert(key.to_string(), delay);
    }

    async fn before_write(&self, key: &str) -> BlobKvResult<()> {
        let delay = self.delays.lock().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().iter().any(|k| k == key) {
            return Err(BlobKvError::unavailable(format!("injected fault for {}", key)));
        }
        Ok(())
    }
}

impl ObjectBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn ensure_bucket(&self) -> BackendFuture<'_, bool> {
        self.inner.ensure_bucket()
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<Bytes>> {
        self.inner.get(key)
    }

    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key).await?;
            self.inner.put(key, body).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key).await?;
            self.inner.delete(key).await
        })
    }
}
