//! Durable object storage for uploaded files.
//!
//! The upload handler only ever talks to the [`FileStorage`] trait. Which backend sits behind it
//! is decided once at startup from [`StorageBackend`] configuration:
//!
//! - [`S3FileStorage`]: Amazon S3 or any S3-compatible store (production)
//! - [`LocalFileStorage`]: a directory on the local filesystem (development)
//! - [`MemoryFileStorage`]: an in-process map (tests, throwaway instances)
//!
//! Every backend creates objects all-or-nothing: a failed or cancelled `store` never leaves a
//! readable partial object under the requested key.

mod errors;
mod local;
mod memory;
mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::StorageBackend;

pub use errors::{Result, StorageError};
pub use local::LocalFileStorage;
pub use memory::MemoryFileStorage;
pub use s3::S3FileStorage;

/// Content type used when neither the client nor the filename tells us anything better
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Request to store one object
#[derive(Debug, Clone)]
pub struct FileStorageRequest {
    /// Key the object is created under
    pub key: String,
    pub content: Bytes,
    pub content_type: String,
}

/// Trait for file storage backends
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Create an object under `request.key`.
    ///
    /// On success the object is immediately readable through [`FileStorage::retrieve`].
    async fn store(&self, request: FileStorageRequest) -> Result<()>;

    /// Read back the full content stored under `key`
    async fn retrieve(&self, key: &str) -> Result<Bytes>;

    /// Check whether an object exists under `key`
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Create a file storage backend based on configuration
pub async fn create_file_storage(backend: &StorageBackend) -> Result<Arc<dyn FileStorage>> {
    match backend {
        StorageBackend::S3 {
            bucket,
            region,
            endpoint_url,
            force_path_style,
        } => {
            tracing::info!(bucket = %bucket, region = ?region, endpoint = ?endpoint_url, "Creating S3 file storage backend");
            let storage = S3FileStorage::from_env(bucket, region.clone(), endpoint_url.as_ref().map(|u| u.to_string()), *force_path_style).await;
            Ok(Arc::new(storage))
        }
        StorageBackend::Local { path } => {
            tracing::info!("Creating local file storage backend (path: {:?})", path);
            if let Err(e) = tokio::fs::create_dir_all(path).await {
                return Err(StorageError::Other(anyhow::anyhow!(
                    "Failed to create local storage directory {:?}: {}",
                    path,
                    e
                )));
            }
            Ok(Arc::new(LocalFileStorage::new(path.clone())))
        }
        StorageBackend::Memory => {
            tracing::warn!("Creating in-memory file storage backend - uploads are lost on restart");
            Ok(Arc::new(MemoryFileStorage::new()))
        }
    }
}
