//! etcd KV operations.
//!
//! Range, Put, and DeleteRange for single keys. Range scans, historical
//! reads, and leases are refused with INVALID_ARGUMENT rather than
//! silently narrowed.

use super::grpc::SharedState;
use super::proto;
use crate::core::error::{BlobKvError, BlobKvResult};
use crate::kv::PutValue;
use tracing::debug;

/// KV service implementation.
#[derive(Clone, Debug)]
pub struct KvService {
    state: SharedState,
}

impl KvService {
    /// Create a new KV service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Handle Range (Get) request.
    pub async fn range(&self, req: proto::RangeRequest) -> BlobKvResult<proto::RangeResponse> {
        if !req.range_end.is_empty() {
            return Err(BlobKvError::invalid_request(
                "range scans are not supported; range_end must be empty",
            ));
        }
        if req.revision != 0 {
            return Err(BlobKvError::invalid_request(
                "historical reads are not supported; revision must be 0",
            ));
        }
        let key = key_from_bytes(req.key)?;
        debug!(key = %key, "range");

        let found = match self.state.store.get(&key).await {
            Ok(kv) => Some(kv),
            Err(BlobKvError::KeyNotFound) => None,
            Err(err) => return Err(err),
        };

        // Never report a header older than the record returned.
        let revision = found
            .as_ref()
            .map_or(0, |kv| kv.mod_revision)
            .max(self.state.store.revision());
        let count = i64::from(found.is_some());

        let kvs = if req.count_only {
            Vec::new()
        } else {
            found
                .into_iter()
                .map(|kv| {
                    let mut kv = proto::KeyValue::from(kv);
                    if req.keys_only {
                        kv.value.clear();
                    }
                    kv
                })
                .collect()
        };

        Ok(proto::RangeResponse {
            header: Some(self.state.response_header(revision)),
            kvs,
            more: false,
            count,
        })
    }

    /// Handle Put request.
    pub async fn put(&self, req: proto::PutRequest) -> BlobKvResult<proto::PutResponse> {
        if req.lease != 0 || req.ignore_lease {
            return Err(BlobKvError::invalid_request("leases are not supported"));
        }
        let value = if req.ignore_value {
            if !req.value.is_empty() {
                return Err(BlobKvError::invalid_request(
                    "value is provided with ignore_value",
                ));
            }
            PutValue::Keep
        } else {
            PutValue::Replace(req.value)
        };
        let key = key_from_bytes(req.key)?;
        debug!(key = %key, "put");

        let outcome = self.state.store.put(key, value).await?;

        Ok(proto::PutResponse {
            header: Some(self.state.response_header(outcome.revision())),
            prev_kv: if req.prev_kv {
                outcome.prev_kv.map(proto::KeyValue::from)
            } else {
                None
            },
        })
    }

    /// Handle DeleteRange request.
    pub async fn delete_range(
        &self,
        req: proto::DeleteRangeRequest,
    ) -> BlobKvResult<proto::DeleteRangeResponse> {
        if !req.range_end.is_empty() {
            return Err(BlobKvError::invalid_request(
                "range deletes are not supported; range_end must be empty",
            ));
        }
        let key = key_from_bytes(req.key)?;
        debug!(key = %key, "delete range");

        let response = match self.state.store.delete(key).await? {
            Some(deleted) => proto::DeleteRangeResponse {
                header: Some(self.state.response_header(deleted.revision)),
                deleted: 1,
                prev_kvs: if req.prev_kv {
                    vec![proto::KeyValue::from(deleted.prev_kv)]
                } else {
                    Vec::new()
                },
            },
            None => proto::DeleteRangeResponse {
                header: Some(self.state.current_header()),
                deleted: 0,
                prev_kvs: Vec::new(),
            },
        };
        Ok(response)
    }
}

/// Object names are strings; etcd keys are bytes.
fn key_from_bytes(key: Vec<u8>) -> BlobKvResult<String> {
    if key.is_empty() {
        return Err(BlobKvError::invalid_request("key is not provided"));
    }
    String::from_utf8(key).map_err(|_| BlobKvError::invalid_request("key must be valid UTF-8"))
}
