//! Stored object format.
//!
//! One JSON document per key:
//!
//! ```json
//! {"Key":"foo","Value":"YmFy","Version":2,"CreateRev":1,"ModRev":2,"Lease":0}
//! ```
//!
//! `Value` is base64, matching how Go's `encoding/json` writes `[]byte`, so
//! buckets written by earlier Go deployments stay readable.

use crate::core::error::BlobKvResult;
use crate::kv::record::KeyValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content type written alongside every object.
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StoredKeyValue {
    key: String,
    #[serde(with = "base64_value")]
    value: Vec<u8>,
    version: i64,
    create_rev: i64,
    mod_rev: i64,
    #[serde(default)]
    lease: i64,
}

/// Serialize a record into its object body.
pub fn encode(kv: &KeyValue) -> BlobKvResult<Bytes> {
    let stored = StoredKeyValue {
        key: kv.key.clone(),
        value: kv.value.clone(),
        version: kv.version,
        create_rev: kv.create_revision,
        mod_rev: kv.mod_revision,
        lease: kv.lease,
    };
    Ok(Bytes::from(serde_json::to_vec(&stored)?))
}

/// Deserialize an object body into a record.
pub fn decode(body: &[u8]) -> BlobKvResult<KeyValue> {
    let stored: StoredKeyValue = serde_json::from_slice(body)?;
    Ok(KeyValue {
        key: stored.key,
        value: stored.value,
        create_revision: stored.create_rev,
        mod_revision: stored.mod_rev,
        version: stored.version,
        lease: stored.lease,
    })
}

mod base64_value {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    // Go encodes a nil slice as `null`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
