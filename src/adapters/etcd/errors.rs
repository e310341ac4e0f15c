//! etcd adapter error mapping.
//!
//! Store errors map to gRPC status codes as follows:
//! - KeyNotFound → NOT_FOUND
//! - InvalidRequest, InvalidUrl → INVALID_ARGUMENT
//! - Unavailable → UNAVAILABLE
//! - Internal → INTERNAL
//! - WatchIdExists → ALREADY_EXISTS
//!
//! Messages carry the `etcdserver: ` prefix etcd clients match on.

use crate::core::error::BlobKvError;
use tonic::{Code, Status};

/// gRPC code for a store error.
pub fn grpc_code(err: &BlobKvError) -> Code {
    match err {
        BlobKvError::KeyNotFound => Code::NotFound,
        BlobKvError::InvalidRequest { .. } | BlobKvError::InvalidUrl { .. } => {
            Code::InvalidArgument
        }
        BlobKvError::Unavailable { .. } => Code::Unavailable,
        BlobKvError::Internal { .. } => Code::Internal,
        BlobKvError::WatchIdExists { .. } => Code::AlreadyExists,
    }
}

/// Client-facing message for a store error.
pub fn etcd_message(err: &BlobKvError) -> String {
    match err {
        BlobKvError::KeyNotFound => "etcdserver: key not found".to_string(),
        BlobKvError::InvalidRequest { message } => format!("etcdserver: {}", message),
        BlobKvError::WatchIdExists { .. } => {
            "etcdserver: mvcc: watcher with the given ID already exists".to_string()
        }
        other => format!("etcdserver: {}", other),
    }
}

impl From<BlobKvError> for Status {
    fn from(err: BlobKvError) -> Self {
        Status::new(grpc_code(&err), etcd_message(&err))
    }
}
