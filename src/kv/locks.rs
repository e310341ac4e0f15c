//! Per-key critical sections.
//!
//! The backend has no compare-and-swap, so every read-modify-write on a
//! key runs while holding that key's async mutex. Keys never contend with
//! each other; entries exist only while someone holds or waits on them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of per-key async mutexes.
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the critical section for `key`, waiting for the current
    /// holder (FIFO) if there is one.
    pub async fn lock(self: &Arc<Self>, key: &str) -> KeyGuard {
        let slot = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(key.to_string()).or_default())
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Check if no key is locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    /// Key held by this guard.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock();
        // Release the mutex while holding the table lock so no new waiter
        // can clone the slot between the release and the count check.
        self.guard.take();
        if let Some(slot) = table.get(&self.key) {
            // One reference in the table and none elsewhere: nobody waits.
            if Arc::strong_count(slot) == 1 {
                table.remove(&self.key);
            }
        }
    }
}
