use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use dashmap::DashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::TransferError;

/// Content type of every derived image.
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Download/upload by bucket and key. No retries happen at this layer; a failed
/// transfer fails the item and the queue redelivers it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches `bucket/key` into the local file `destination`.
    async fn download(&self, bucket: &str, key: &str, destination: &Path)
    -> Result<(), TransferError>;

    /// Stores the local file `source` as `bucket/key`.
    async fn upload(&self, bucket: &str, source: &Path, key: &str) -> Result<(), TransferError>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), TransferError> {
        let download_error = |reason: String| TransferError::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        };
        let local_error = |source| TransferError::LocalFile {
            path: destination.to_path_buf(),
            source,
        };

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| download_error(DisplayErrorContext(&e).to_string()))?;

        let body = output.body.into_async_read();
        tokio::pin!(body);
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(local_error)?;

        let bytes = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| download_error(e.to_string()))?;
        file.flush().await.map_err(local_error)?;

        tracing::debug!("Downloaded s3://{}/{} ({} bytes)", bucket, key, bytes);
        Ok(())
    }

    async fn upload(&self, bucket: &str, source: &Path, key: &str) -> Result<(), TransferError> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| TransferError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: format!("cannot read {}: {}", source.display(), e),
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(JPEG_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| TransferError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!("Uploaded {} to s3://{}/{}", source.display(), bucket, key);
        Ok(())
    }
}

/// Object store kept in process memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.objects
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Sorted keys stored in `bucket`.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<(), TransferError> {
        let data = self.get(bucket, key).ok_or_else(|| TransferError::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: "NoSuchKey: the specified key does not exist".to_string(),
        })?;

        tokio::fs::write(destination, data)
            .await
            .map_err(|source| TransferError::LocalFile {
                path: destination.to_path_buf(),
                source,
            })
    }

    async fn upload(&self, bucket: &str, source: &Path, key: &str) -> Result<(), TransferError> {
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| TransferError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: format!("cannot read {}: {}", source.display(), e),
            })?;
        self.put(bucket, key, data);
        Ok(())
    }
}
