//! Uniform object-storage facade.
//!
//! A capability interface over cloud object stores, selected by a factory
//! keyed on provider. Strictly pass-through: every [`Bucket`] method maps
//! onto one vendor operation, and the only added behavior is wrapping
//! failures with the operation name and target path.
//!
//! Credentials and endpoints are caller-supplied configuration; this module
//! does no credential discovery of its own.

mod opendal_store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use opendal_store::connect;

/// A storage operation failure, carrying the operation and target path
/// alongside the vendor error.
#[derive(Error, Debug)]
#[error("storage {op} failed for '{path}': {source}")]
pub struct StorageError {
    /// The facade operation that failed (e.g. `"read"`, `"signed_url"`).
    pub op: &'static str,
    /// The bucket path or prefix the operation targeted.
    pub path: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StorageError {
    pub(crate) fn wrap(
        op: &'static str,
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            op,
            path: path.into(),
            source: Box::new(source),
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Capability interface for one bucket on one provider.
#[async_trait::async_trait]
pub trait Bucket: Send + Sync {
    /// Upload in-memory bytes to `path`.
    async fn upload(&self, data: Bytes, path: &str) -> StorageResult<()>;

    /// Upload everything read from `reader` to `path`.
    async fn upload_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
    ) -> StorageResult<()>;

    /// Upload a local file to `path`.
    async fn upload_file(&self, local: &Path, path: &str) -> StorageResult<()>;

    /// Delete the object at `path`.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Read the object at `path`.
    async fn read(&self, path: &str) -> StorageResult<Bytes>;

    /// List object paths under `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Produce a signed URL for reading `path`, valid for `ttl`.
    async fn signed_url(&self, path: &str, ttl: Duration) -> StorageResult<String>;

    /// Download the object at `path` to a local file.
    async fn download(&self, path: &str, local: &Path) -> StorageResult<()>;

    /// Delete every object under `prefix`.
    async fn delete_folder(&self, prefix: &str) -> StorageResult<()>;
}

/// Shared bucket pointer.
pub type BucketPtr = Arc<dyn Bucket>;

/// Provider selection and connection parameters for [`connect`].
#[derive(Debug, Clone)]
pub enum Provider {
    /// AWS S3 or any S3-compatible endpoint (MinIO, R2, OCI's
    /// compatibility API, ...).
    S3 {
        bucket: String,
        region: String,
        /// Custom endpoint for S3-compatible services; `None` for AWS.
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
    /// Local filesystem rooted at `root`. Intended for development.
    Fs { root: String },
    /// In-process store. Intended for tests.
    Memory,
}
