//! Recursive folder operations on top of the single-file pipeline.
//!
//! Uploads are fail-fast: the first broken file aborts the walk with its
//! path named. Deletes keep going and aggregate per-item failures into a
//! [`DeleteReport`], so one stuck entry does not silently strand the rest
//! of the tree.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use remote_store::StoreError;

use crate::pipeline::{
    check_delete_guard, remote_full_path, TransferError, TransferPipeline,
};
use crate::token::{AccessKind, TransferToken};

/// Outcome of a recursive delete. `failed` pairs each undeletable path
/// with the error it hit.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl TransferPipeline {
    /// Upload a local directory tree under `bucket/remote_path`, creating
    /// remote directories as needed. Returns the number of files uploaded.
    pub async fn upload_folder(
        &self,
        token: &TransferToken,
        local_dir: &Path,
        remote_path: &str,
    ) -> Result<u64, TransferError> {
        self.require(token, AccessKind::Write)?;

        let rel = remote_path.trim_matches('/').to_string();
        let mut uploaded = 0u64;
        self.upload_tree(token, local_dir.to_path_buf(), rel, &mut uploaded)
            .await?;
        tracing::info!(
            "uploaded folder {:?} ({} files) under {}",
            local_dir,
            uploaded,
            token.bucket
        );
        Ok(uploaded)
    }

    fn upload_tree<'a>(
        &'a self,
        token: &'a TransferToken,
        local: PathBuf,
        rel: String,
        uploaded: &'a mut u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + 'a>> {
        Box::pin(async move {
            self.mkdir_idempotent(&remote_full_path(token, &rel)).await?;

            for name in sorted_local_entries(&local).await? {
                let child_local = local.join(&name);
                let child_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };

                let file_type = tokio::fs::metadata(&child_local)
                    .await
                    .map_err(|e| local_walk_err(&child_local, e))?;
                if file_type.is_dir() {
                    self.upload_tree(token, child_local, child_rel, uploaded)
                        .await?;
                } else {
                    self.upload(token, &child_local, &child_rel).await?;
                    *uploaded += 1;
                }
            }
            Ok(())
        })
    }

    /// Recursively delete `bucket/remote_path`, subject to the same guards
    /// as single-file delete. Individual failures are collected rather than
    /// aborting the walk.
    pub async fn delete_folder(
        &self,
        token: &TransferToken,
        remote_path: &str,
    ) -> Result<DeleteReport, TransferError> {
        self.require(token, AccessKind::Delete)?;
        let full = remote_full_path(token, remote_path);
        check_delete_guard(&token.bucket, &full)?;

        let mut report = DeleteReport::default();
        self.delete_tree(full.trim_end_matches('/').to_string(), &mut report)
            .await;
        tracing::info!(
            "deleted folder {}: {} removed, {} failed",
            full,
            report.removed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn delete_tree<'a>(
        &'a self,
        path: String,
        report: &'a mut DeleteReport,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let names = match self.store().list_dir(&path).await {
                Ok(names) => names,
                Err(e) => {
                    report.failed.push((path, e.to_string()));
                    return;
                }
            };

            for name in names {
                let child = format!("{path}/{name}");
                match self.store().stat(&child).await {
                    Ok(stat) if stat.is_dir => self.delete_tree(child, report).await,
                    Ok(_) => match self.store().remove_file(&child).await {
                        Ok(()) => report.removed.push(child),
                        Err(e) => report.failed.push((child, e.to_string())),
                    },
                    Err(e) => report.failed.push((child, e.to_string())),
                }
            }

            // The directory itself, once its children are gone. A leftover
            // child shows up here as a non-empty-dir failure.
            match self.store().remove_dir(&path).await {
                Ok(()) => report.removed.push(path),
                Err(e) => report.failed.push((path, e.to_string())),
            }
        })
    }

    async fn mkdir_idempotent(&self, path: &str) -> Result<(), TransferError> {
        match self.store().mkdir(path).await {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn sorted_local_entries(dir: &Path) -> Result<Vec<String>, TransferError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| local_walk_err(dir, e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| local_walk_err(dir, e))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn local_walk_err(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::Local {
        path: format!("{path:?}"),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::pipeline::tests::{all, token_with};
    use async_trait::async_trait;
    use remote_store::{
        EntryStat, LocalDirStore, RemoteStore, StoreReader, StoreResult, StoreWriter,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, TempDir, TransferPipeline) {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let store = LocalDirStore::new(remote.path()).unwrap();
        store.mkdir("archive").await.unwrap();
        store.mkdir("archive/drop").await.unwrap();
        (remote, local, TransferPipeline::new(Arc::new(store)))
    }

    // Three files at the root plus one subdirectory holding one file.
    fn seed_local_tree(root: &Path) {
        std::fs::create_dir_all(root.join("photos")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("b.txt"), b"beta").unwrap();
        std::fs::write(root.join("c.txt"), b"gamma").unwrap();
        std::fs::write(root.join("photos/d.jpg"), b"delta").unwrap();
    }

    #[tokio::test]
    async fn test_upload_folder_mirrors_tree_and_roundtrips() {
        let (remote, local, pipeline) = fixture().await;
        let token = token_with("archive", &hex::encode(crypto::generate_key()), all());

        let tree = local.path().join("tree");
        seed_local_tree(&tree);

        let uploaded = pipeline
            .upload_folder(&token, &tree, "drop/batch")
            .await
            .unwrap();
        assert_eq!(uploaded, 4);
        assert!(remote.path().join("archive/drop/batch/a.txt").exists());
        assert!(remote
            .path()
            .join("archive/drop/batch/photos/d.jpg")
            .exists());

        // Files came through the encrypting pipeline, not a raw copy.
        let raw = std::fs::read(remote.path().join("archive/drop/batch/a.txt")).unwrap();
        assert_ne!(raw, b"alpha");
        let out = local.path().join("d.out");
        pipeline
            .download(&token, "drop/batch/photos/d.jpg", &out)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"delta");
    }

    #[tokio::test]
    async fn test_upload_folder_into_existing_directories() {
        let (_remote, local, pipeline) = fixture().await;
        let token = token_with("archive", &hex::encode(crypto::generate_key()), all());

        let tree = local.path().join("tree");
        seed_local_tree(&tree);

        pipeline
            .upload_folder(&token, &tree, "drop/batch")
            .await
            .unwrap();
        // Re-uploading over existing remote directories must not fail.
        let again = pipeline
            .upload_folder(&token, &tree, "drop/batch")
            .await
            .unwrap();
        assert_eq!(again, 4);
    }

    #[tokio::test]
    async fn test_delete_folder_removes_whole_tree() {
        let (remote, local, pipeline) = fixture().await;
        let token = token_with("archive", &hex::encode(crypto::generate_key()), all());

        let tree = local.path().join("tree");
        seed_local_tree(&tree);
        pipeline
            .upload_folder(&token, &tree, "drop/batch")
            .await
            .unwrap();

        let report = pipeline.delete_folder(&token, "drop/batch").await.unwrap();
        assert!(report.is_clean(), "failures: {:?}", report.failed);
        // 4 files + 2 directories (batch, photos).
        assert_eq!(report.removed.len(), 6);
        assert!(!remote.path().join("archive/drop/batch").exists());
        assert!(remote.path().join("archive/drop").exists());
    }

    #[tokio::test]
    async fn test_delete_folder_guards_bucket_and_subfolders() {
        let (_remote, _local, pipeline) = fixture().await;
        let token = token_with("archive", &hex::encode(crypto::generate_key()), all());

        for protected in ["", "drop"] {
            assert!(matches!(
                pipeline.delete_folder(&token, protected).await,
                Err(TransferError::ProtectedPath(_))
            ));
        }
    }

    /// Store wrapper that refuses to remove files whose path contains a
    /// marker, for exercising failure aggregation.
    struct StickyStore {
        inner: LocalDirStore,
        sticky: &'static str,
    }

    #[async_trait]
    impl RemoteStore for StickyStore {
        async fn stat(&self, path: &str) -> StoreResult<EntryStat> {
            self.inner.stat(path).await
        }
        async fn open_read(&self, path: &str) -> StoreResult<StoreReader> {
            self.inner.open_read(path).await
        }
        async fn open_write(&self, path: &str) -> StoreResult<StoreWriter> {
            self.inner.open_write(path).await
        }
        async fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
            self.inner.list_dir(path).await
        }
        async fn mkdir(&self, path: &str) -> StoreResult<()> {
            self.inner.mkdir(path).await
        }
        async fn remove_file(&self, path: &str) -> StoreResult<()> {
            if path.contains(self.sticky) {
                return Err(StoreError::Io {
                    path: path.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "file is busy",
                    ),
                });
            }
            self.inner.remove_file(path).await
        }
        async fn remove_dir(&self, path: &str) -> StoreResult<()> {
            self.inner.remove_dir(path).await
        }
    }

    #[tokio::test]
    async fn test_delete_folder_aggregates_failures_and_continues() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let inner = LocalDirStore::new(remote.path()).unwrap();
        inner.mkdir("archive").await.unwrap();
        inner.mkdir("archive/drop").await.unwrap();
        let pipeline = TransferPipeline::new(Arc::new(StickyStore {
            inner,
            sticky: "d.jpg",
        }));
        let token = token_with("archive", &hex::encode(crypto::generate_key()), all());

        let tree = local.path().join("tree");
        seed_local_tree(&tree);
        pipeline
            .upload_folder(&token, &tree, "drop/batch")
            .await
            .unwrap();

        let report = pipeline.delete_folder(&token, "drop/batch").await.unwrap();

        // The sticky file fails, and so do its ancestor directories; every
        // sibling is still removed.
        assert!(!report.is_clean());
        let failed: Vec<_> = report.failed.iter().map(|(p, _)| p.as_str()).collect();
        assert!(failed.contains(&"archive/drop/batch/photos/d.jpg"));
        assert!(failed.contains(&"archive/drop/batch/photos"));
        assert!(failed.contains(&"archive/drop/batch"));

        assert!(report.removed.contains(&"archive/drop/batch/a.txt".into()));
        assert!(report.removed.contains(&"archive/drop/batch/b.txt".into()));
        assert!(report.removed.contains(&"archive/drop/batch/c.txt".into()));
        assert!(remote.path().join("archive/drop/batch/photos/d.jpg").exists());
    }
}
