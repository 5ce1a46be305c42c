use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{FileStorage, FileStorageRequest, Result, StorageError};

#[derive(Debug, Clone)]
struct StoredObject {
    content: Bytes,
    content_type: String,
}

/// In-memory storage backend. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryFileStorage {
    objects: DashMap<String, StoredObject>,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Content type recorded for `key`, if the object exists
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|object| object.content_type.clone())
    }
}

#[async_trait]
impl FileStorage for MemoryFileStorage {
    async fn store(&self, request: FileStorageRequest) -> Result<()> {
        self.objects.insert(
            request.key,
            StoredObject {
                content: request.content,
                content_type: request.content_type,
            },
        );
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        self.objects
            .get(key)
            .map(|object| object.content.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }
}
