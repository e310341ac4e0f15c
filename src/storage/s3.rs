//! S3-compatible object backend.
//!
//! Talks to MinIO, AWS S3, or any endpoint speaking the S3 API, using
//! path-style addressing and static credentials from the blob URL.

use super::backend::{BackendFuture, ObjectBackend};
use super::codec::CONTENT_TYPE;
use super::url::BlobUrl;
use crate::core::error::{BlobKvError, BlobKvResult};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

/// Region sent when the deployment does not care (MinIO ignores it).
pub const DEFAULT_REGION: &str = "us-east-1";

/// Backend storing one object per key in a single bucket.
#[derive(Clone, Debug)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Build a client for the endpoint described by `url`.
    pub fn new(url: &BlobUrl, region: &str) -> Self {
        let credentials = Credentials::new(
            url.username.clone(),
            url.password.clone(),
            None,
            None,
            "blob-url",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(url.endpoint())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: url.bucket.clone(),
        }
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn unavailable<E>(op: &str, err: E) -> BlobKvError
where
    E: std::error::Error + 'static,
{
    BlobKvError::unavailable(format!("{}: {}", op, DisplayErrorContext(err)))
}

impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn ensure_bucket(&self) -> BackendFuture<'_, bool> {
        Box::pin(async move {
            match self.client.head_bucket().bucket(&self.bucket).send().await {
                Ok(_) => Ok(false),
                Err(err) => {
                    let missing = err
                        .as_service_error()
                        .is_some_and(|e| e.is_not_found());
                    if !missing {
                        return Err(unavailable("head bucket", err));
                    }
                    self.client
                        .create_bucket()
                        .bucket(&self.bucket)
                        .send()
                        .await
                        .map_err(|e| unavailable("create bucket", e))?;
                    Ok(true)
                }
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    if err
                        .as_service_error()
                        .is_some_and(|e| e.is_no_such_key())
                    {
                        return Ok(None);
                    }
                    return Err(unavailable("get object", err));
                }
            };

            let body: BlobKvResult<Bytes> = output
                .body
                .collect()
                .await
                .map(|data| data.into_bytes())
                .map_err(|e| unavailable("read object body", e));
            body.map(Some)
        })
    }

    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(CONTENT_TYPE)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| unavailable("put object", e))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            // S3 reports success for absent objects.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| unavailable("delete object", e))?;
            Ok(())
        })
    }
}
