use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{FileStorage, FileStorageRequest, Result, StorageError};

/// Directory holding in-flight writes, relative to the storage root
const STAGING_DIR: &str = ".staging";

/// Local filesystem storage backend - stores each object as a file under `base_path`.
///
/// Writes go to a staging file first and are renamed into place once fully flushed, so a
/// reader never observes a half-written object.
pub struct LocalFileStorage {
    base_path: PathBuf,
}

impl LocalFileStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Map a storage key to a path under the root, refusing anything that could escape it
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(part) if part != STAGING_DIR));

        if !is_plain {
            return Err(StorageError::Other(anyhow::anyhow!("Invalid storage key: {:?}", key)));
        }

        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(&self, request: FileStorageRequest) -> Result<()> {
        let full_path = self.object_path(&request.key)?;

        let staging_dir = self.base_path.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir).await?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Removed on every exit path except a successful rename, including cancellation
        let staging_path = scopeguard::guard(staging_dir.join(uuid::Uuid::new_v4().simple().to_string()), |path| {
            let _ = std::fs::remove_file(path);
        });

        let mut file = fs::File::create(&*staging_path).await?;
        file.write_all(&request.content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&*staging_path, &full_path).await?;
        let _ = scopeguard::ScopeGuard::into_inner(staging_path);

        tracing::debug!(key = %request.key, size = request.content.len(), "Stored object on local filesystem");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        let full_path = self.object_path(key)?;
        let content = fs::read(&full_path).await?;
        Ok(Bytes::from(content))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.object_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, content: &'static [u8]) -> FileStorageRequest {
        FileStorageRequest {
            key: key.to_string(),
            content: Bytes::from_static(content),
            content_type: "text/plain".to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_storage_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(temp_dir.path().to_path_buf());

        storage.store(request("uploads/abc-note.txt", b"test content")).await.unwrap();

        assert!(storage.exists("uploads/abc-note.txt").await.unwrap());
        let retrieved = storage.retrieve("uploads/abc-note.txt").await.unwrap();
        assert_eq!(&retrieved[..], b"test content");
    }

    #[tokio::test]
    async fn test_local_storage_leaves_no_staging_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(temp_dir.path().to_path_buf());

        storage.store(request("one", b"1")).await.unwrap();
        storage.store(request("two", b"2")).await.unwrap();

        let mut staged = std::fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap();
        assert!(staged.next().is_none());
    }

    #[tokio::test]
    async fn test_local_storage_failed_rename_cleans_up() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(temp_dir.path().to_path_buf());

        // A non-empty directory at the target makes the final rename fail
        let blocked = temp_dir.path().join("blocked");
        std::fs::create_dir_all(&blocked).unwrap();
        std::fs::write(blocked.join("occupant"), b"x").unwrap();

        let result = storage.store(request("blocked", b"partial")).await;
        assert!(result.is_err());

        let mut staged = std::fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap();
        assert!(staged.next().is_none());
        assert!(storage.retrieve("blocked").await.is_err());
        assert_eq!(std::fs::read(blocked.join("occupant")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_local_storage_retrieve_nonexistent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(temp_dir.path().to_path_buf());

        let result = storage.retrieve("nonexistent/file.dat").await;
        assert!(matches!(result, Err(StorageError::NotFound)));
        assert!(!storage.exists("nonexistent/file.dat").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_storage_rejects_escaping_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(temp_dir.path().join("root"));

        for key in ["../outside", "/etc/passwd", "a/../../b", "", ".staging/x"] {
            let result = storage.store(request(key, b"nope")).await;
            assert!(matches!(result, Err(StorageError::Other(_))), "key {key:?} should be rejected");
        }
        assert!(!temp_dir.path().join("outside").exists());
    }
}
