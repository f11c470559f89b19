//! opendal-backed [`Bucket`] adapter.
//!
//! One `Operator` per bucket; every trait method is a single `Operator`
//! call plus error wrapping.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use opendal::layers::LoggingLayer;
use opendal::services::{Fs, Memory, S3};
use opendal::{EntryMode, Operator};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Bucket, BucketPtr, Provider, StorageError, StorageResult};

struct OpendalBucket {
    op: Operator,
}

/// Strip a leading slash; object stores key from the bucket root.
fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Prefixes address "folders"; a trailing slash scopes the operation to the
/// prefix's contents rather than a single key.
fn folder(prefix: &str) -> String {
    let prefix = normalize(prefix);
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

#[async_trait::async_trait]
impl Bucket for OpendalBucket {
    async fn upload(&self, data: Bytes, path: &str) -> StorageResult<()> {
        let path = normalize(path);
        self.op
            .write(path, data)
            .await
            .map_err(|e| StorageError::wrap("upload", path, e))?;
        Ok(())
    }

    async fn upload_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
    ) -> StorageResult<()> {
        let path = normalize(path);

        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StorageError::wrap("upload", path, e))?;

        self.op
            .write(path, buf)
            .await
            .map_err(|e| StorageError::wrap("upload", path, e))?;
        Ok(())
    }

    async fn upload_file(&self, local: &Path, path: &str) -> StorageResult<()> {
        let path = normalize(path);

        let data = tokio::fs::read(local)
            .await
            .map_err(|e| StorageError::wrap("upload_file", local.display().to_string(), e))?;

        self.op
            .write(path, data)
            .await
            .map_err(|e| StorageError::wrap("upload_file", path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path);
        self.op
            .delete(path)
            .await
            .map_err(|e| StorageError::wrap("delete", path, e))?;
        Ok(())
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let path = normalize(path);
        let buffer = self
            .op
            .read(path)
            .await
            .map_err(|e| StorageError::wrap("read", path, e))?;
        Ok(buffer.to_bytes())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let prefix = folder(prefix);
        let entries = self
            .op
            .list_with(&prefix)
            .recursive(true)
            .await
            .map_err(|e| StorageError::wrap("list", prefix.clone(), e))?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.metadata().mode() == EntryMode::FILE)
            .map(|entry| entry.path().to_string())
            .collect())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> StorageResult<String> {
        let path = normalize(path);
        let presigned = self
            .op
            .presign_read(path, ttl)
            .await
            .map_err(|e| StorageError::wrap("signed_url", path, e))?;
        Ok(presigned.uri().to_string())
    }

    async fn download(&self, path: &str, local: &Path) -> StorageResult<()> {
        let path = normalize(path);

        let buffer = self
            .op
            .read(path)
            .await
            .map_err(|e| StorageError::wrap("download", path, e))?;

        tokio::fs::write(local, buffer.to_bytes())
            .await
            .map_err(|e| StorageError::wrap("download", local.display().to_string(), e))?;
        Ok(())
    }

    async fn delete_folder(&self, prefix: &str) -> StorageResult<()> {
        let prefix = folder(prefix);
        self.op
            .remove_all(&prefix)
            .await
            .map_err(|e| StorageError::wrap("delete_folder", prefix.clone(), e))?;
        Ok(())
    }
}

/// Connect to a bucket on the given provider.
///
/// Fails with a wrapped `connect` error if the operator cannot be built
/// from the supplied parameters.
pub fn connect(provider: Provider) -> StorageResult<BucketPtr> {
    let op = match provider {
        Provider::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            let mut builder = S3::default()
                .bucket(&bucket)
                .region(&region)
                .access_key_id(&access_key_id)
                .secret_access_key(&secret_access_key);

            if let Some(endpoint) = endpoint.as_deref() {
                builder = builder.endpoint(endpoint);
            }

            Operator::new(builder)
                .map_err(|e| StorageError::wrap("connect", bucket.clone(), e))?
                .layer(LoggingLayer::default())
                .finish()
        }
        Provider::Fs { root } => {
            let builder = Fs::default().root(&root);
            Operator::new(builder)
                .map_err(|e| StorageError::wrap("connect", root.clone(), e))?
                .layer(LoggingLayer::default())
                .finish()
        }
        Provider::Memory => {
            let builder = Memory::default();
            Operator::new(builder)
                .map_err(|e| StorageError::wrap("connect", "memory", e))?
                .layer(LoggingLayer::default())
                .finish()
        }
    };

    Ok(Arc::new(OpendalBucket { op }) as BucketPtr)
}
