//! Remote storage seam for vaultxfer.
//!
//! The transfer pipeline and the server only ever talk to a [`RemoteStore`],
//! never to a concrete transport. [`LocalDirStore`] backs the trait with a
//! mounted directory; network transports (SFTP and friends) plug in behind
//! the same trait.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("remote object not found: {0}")]
    NotFound(String),
    #[error("remote object already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid remote path: {0}")]
    InvalidPath(String),
    #[error("remote i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.to_string()),
            _ => StoreError::Io {
                path: path.to_string(),
                source: err,
            },
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed byte streams so callers stay independent of the backing transport.
pub type StoreReader = Box<dyn AsyncRead + Unpin + Send>;
pub type StoreWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Metadata for a single remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    pub size: u64,
    pub is_dir: bool,
}

/// File operations against the remote storage root.
///
/// Paths are `/`-separated and relative to the store root; the first
/// component is a bucket name.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn stat(&self, path: &str) -> StoreResult<EntryStat>;
    async fn open_read(&self, path: &str) -> StoreResult<StoreReader>;
    async fn open_write(&self, path: &str) -> StoreResult<StoreWriter>;
    /// Entry names (not full paths) directly under `path`.
    async fn list_dir(&self, path: &str) -> StoreResult<Vec<String>>;
    /// Create a single directory. Fails with `AlreadyExists` if present.
    async fn mkdir(&self, path: &str) -> StoreResult<()>;
    async fn remove_file(&self, path: &str) -> StoreResult<()>;
    /// Remove an empty directory.
    async fn remove_dir(&self, path: &str) -> StoreResult<()>;
}

/// Store backed by a local directory (a mount point of the remote share).
#[derive(Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StoreError::from_io(&root.to_string_lossy(), e))?;
        Ok(Self { root })
    }

    /// Resolve a relative store path under the root, rejecting anything that
    /// could escape it.
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        if path.is_empty() || path.starts_with('/') {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let rel = Path::new(path);
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StoreError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl RemoteStore for LocalDirStore {
    async fn stat(&self, path: &str) -> StoreResult<EntryStat> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        Ok(EntryStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    async fn open_read(&self, path: &str) -> StoreResult<StoreReader> {
        let full = self.resolve(path)?;
        let file = fs::File::open(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> StoreResult<StoreWriter> {
        let full = self.resolve(path)?;
        let file = fs::File::create(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let full = self.resolve(path)?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::from_io(path, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn mkdir(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        fs::create_dir(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        tracing::debug!("created remote directory {}", path);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        tracing::debug!("removed remote file {}", path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        fs::remove_dir(&full)
            .await
            .map_err(|e| StoreError::from_io(path, e))?;
        tracing::debug!("removed remote directory {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_read_roundtrip() -> StoreResult<()> {
        let temp = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp.path())?;

        store.mkdir("bucket").await?;
        let mut w = store.open_write("bucket/file.bin").await?;
        w.write_all(b"payload bytes").await.unwrap();
        w.shutdown().await.unwrap();

        let stat = store.stat("bucket/file.bin").await?;
        assert_eq!(stat.size, 13);
        assert!(!stat.is_dir);

        let mut r = store.open_read("bucket/file.bin").await?;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload bytes");

        Ok(())
    }

    #[tokio::test]
    async fn test_mkdir_twice_reports_already_exists() {
        let temp = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp.path()).unwrap();

        store.mkdir("bucket").await.unwrap();
        match store.mkdir("bucket").await {
            Err(StoreError::AlreadyExists(p)) => assert_eq!(p, "bucket"),
            other => panic!("expected AlreadyExists, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_missing_object_reports_not_found() {
        let temp = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp.path()).unwrap();

        assert!(matches!(
            store.stat("no/such/file").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.open_read("absent.bin").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_paths_rejected() {
        let temp = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp.path()).unwrap();

        for bad in ["../escape", "/absolute", "bucket/../../etc", ""] {
            assert!(
                matches!(store.stat(bad).await, Err(StoreError::InvalidPath(_))),
                "path {:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_list_and_remove_dir() -> StoreResult<()> {
        let temp = TempDir::new().unwrap();
        let store = LocalDirStore::new(temp.path())?;

        store.mkdir("bucket").await?;
        store.mkdir("bucket/sub").await?;
        let mut w = store.open_write("bucket/a.bin").await?;
        w.shutdown().await.unwrap();

        let mut names = store.list_dir("bucket").await?;
        names.sort();
        assert_eq!(names, vec!["a.bin".to_string(), "sub".to_string()]);

        // Non-empty directory cannot be removed.
        assert!(store.remove_dir("bucket").await.is_err());

        store.remove_file("bucket/a.bin").await?;
        store.remove_dir("bucket/sub").await?;
        store.remove_dir("bucket").await?;
        Ok(())
    }
}
