//! Key-value records and change events.

use super::revision::Revision;

/// Current state of a single key.
///
/// `create_revision <= mod_revision` always holds, and `version >= 1`
/// while the key exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValue {
    /// The key (object name in the bucket).
    pub key: String,

    /// Opaque value bytes.
    pub value: Vec<u8>,

    /// Revision at which the key was created.
    pub create_revision: Revision,

    /// Revision of the most recent mutation.
    pub mod_revision: Revision,

    /// Number of mutations since creation.
    pub version: i64,

    /// Lease identifier. Always 0; leases are not granted.
    pub lease: i64,
}

impl KeyValue {
    /// Build the record for a key created at `revision`.
    pub fn created(key: impl Into<String>, value: Vec<u8>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            value,
            create_revision: revision,
            mod_revision: revision,
            version: 1,
            lease: 0,
        }
    }

    /// Build the record that replaces `self` at `revision`.
    pub fn successor(&self, value: Vec<u8>, revision: Revision) -> Self {
        debug_assert!(revision > self.mod_revision);
        Self {
            key: self.key.clone(),
            value,
            create_revision: self.create_revision,
            mod_revision: revision,
            version: self.version + 1,
            lease: self.lease,
        }
    }

    /// Record shape carried by a DELETE event: key and deletion revision only.
    pub fn tombstone(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            mod_revision: revision,
            ..Self::default()
        }
    }
}

/// Event type for watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted.
    Delete,
}

/// A committed mutation, as fanned out to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    /// Type of event.
    pub event_type: EventType,

    /// New state for Put; key and deletion revision for Delete.
    pub kv: KeyValue,

    /// State before the mutation, if the key existed.
    pub prev_kv: Option<KeyValue>,
}

impl KvEvent {
    /// Create a Put event.
    pub fn put(kv: KeyValue, prev_kv: Option<KeyValue>) -> Self {
        Self {
            event_type: EventType::Put,
            kv,
            prev_kv,
        }
    }

    /// Create a Delete event.
    pub fn delete(key: impl Into<String>, revision: Revision, prev_kv: KeyValue) -> Self {
        Self {
            event_type: EventType::Delete,
            kv: KeyValue::tombstone(key, revision),
            prev_kv: Some(prev_kv),
        }
    }

    /// Revision that produced this event.
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }

    /// Key this event applies to.
    pub fn key(&self) -> &str {
        &self.kv.key
    }
}
