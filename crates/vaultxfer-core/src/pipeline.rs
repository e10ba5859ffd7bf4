//! Single-file data plane: encrypted upload, download, and guarded delete.
//!
//! Ciphertext is staged in a named temp file that is removed on drop, so
//! cleanup happens on every path, success or failure. Validation
//! (permissions, delete guards) always runs before any remote I/O.

use std::path::Path;
use std::sync::Arc;

use remote_store::{RemoteStore, StoreError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::crypto::{self, CryptoError};
use crate::token::{AccessKind, TransferToken};

const COPY_BUF_LEN: usize = 64 * 1024;
const PROGRESS_STEP: u64 = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("token does not permit {action} on bucket '{bucket}'")]
    PermissionDenied {
        action: &'static str,
        bucket: String,
    },
    #[error("protected path '{0}': bucket roots and server-provisioned subfolders cannot be deleted")]
    ProtectedPath(String),
    #[error("decrypt failed for '{path}': token key mismatch or corrupted remote object")]
    Decrypt { path: String },
    #[error("encryption failed")]
    Encrypt,
    #[error("token key is unusable: {0}")]
    BadKey(CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote i/o error on '{path}': {source}")]
    RemoteIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("local file error on '{path}': {source}")]
    Local {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reject deletes targeting the bucket root or a top-level subfolder
/// directly under it (server-provisioned structure). Purely
/// path-syntactic, so client and server compute it identically.
pub fn check_delete_guard(bucket: &str, remote_full: &str) -> Result<(), TransferError> {
    let trimmed = remote_full.trim_end_matches('/');
    if trimmed == bucket {
        return Err(TransferError::ProtectedPath(trimmed.to_string()));
    }
    if let Some((parent, _)) = trimmed.rsplit_once('/') {
        if parent == bucket {
            return Err(TransferError::ProtectedPath(trimmed.to_string()));
        }
    }
    Ok(())
}

/// Full remote path for a token-scoped relative path.
pub fn remote_full_path(token: &TransferToken, remote_path: &str) -> String {
    format!("{}/{}", token.bucket, remote_path.trim_start_matches('/'))
}

#[derive(Clone)]
pub struct TransferPipeline {
    store: Arc<dyn RemoteStore>,
}

impl TransferPipeline {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &dyn RemoteStore {
        self.store.as_ref()
    }

    pub(crate) fn require(
        &self,
        token: &TransferToken,
        access: AccessKind,
    ) -> Result<(), TransferError> {
        if !token.permissions.allows(access) {
            return Err(TransferError::PermissionDenied {
                action: access.as_str(),
                bucket: token.bucket.clone(),
            });
        }
        Ok(())
    }

    /// Encrypt `local` under the token key and store it at
    /// `bucket/remote_path`. Returns the full remote path written.
    pub async fn upload(
        &self,
        token: &TransferToken,
        local: &Path,
        remote_path: &str,
    ) -> Result<String, TransferError> {
        self.require(token, AccessKind::Write)?;
        let key = token.key_bytes().map_err(TransferError::BadKey)?;
        let full = remote_full_path(token, remote_path);

        let plaintext = tokio::fs::read(local).await.map_err(|e| local_err(local, e))?;
        let sealed = crypto::encrypt(&key, &plaintext).map_err(|_| TransferError::Encrypt)?;

        // Staged ciphertext lives in a temp file removed on drop.
        let staged =
            tempfile::NamedTempFile::new().map_err(|e| local_err(std::env::temp_dir(), e))?;
        std::fs::write(staged.path(), &sealed).map_err(|e| local_err(staged.path(), e))?;

        let mut reader = tokio::fs::File::open(staged.path())
            .await
            .map_err(|e| local_err(staged.path(), e))?;
        let mut writer = self.store.open_write(&full).await?;
        copy_with_progress(&mut reader, &mut writer, sealed.len() as u64, &full)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => local_err(staged.path(), e),
                CopyError::Write(e) => remote_err(&full, e),
            })?;
        writer.shutdown().await.map_err(|e| remote_err(&full, e))?;

        tracing::info!("uploaded {:?} to {} ({} bytes)", local, full, sealed.len());
        Ok(full)
    }

    /// Fetch `bucket/remote_path`, decrypt under the token key, and write
    /// the plaintext to `local`.
    pub async fn download(
        &self,
        token: &TransferToken,
        remote_path: &str,
        local: &Path,
    ) -> Result<String, TransferError> {
        self.require(token, AccessKind::Read)?;
        let key = token.key_bytes().map_err(TransferError::BadKey)?;
        let full = remote_full_path(token, remote_path);

        let stat = self.store.stat(&full).await?;
        let mut reader = self.store.open_read(&full).await?;

        let staged =
            tempfile::NamedTempFile::new().map_err(|e| local_err(std::env::temp_dir(), e))?;
        {
            let mut writer = tokio::fs::File::create(staged.path())
                .await
                .map_err(|e| local_err(staged.path(), e))?;
            copy_with_progress(&mut reader, &mut writer, stat.size, &full)
                .await
                .map_err(|e| match e {
                    CopyError::Read(e) => remote_err(&full, e),
                    CopyError::Write(e) => local_err(staged.path(), e),
                })?;
            writer.flush().await.map_err(|e| local_err(staged.path(), e))?;
        }

        let sealed = std::fs::read(staged.path()).map_err(|e| local_err(staged.path(), e))?;
        let plaintext =
            crypto::decrypt(&key, &sealed).map_err(|_| TransferError::Decrypt { path: full.clone() })?;
        tokio::fs::write(local, plaintext)
            .await
            .map_err(|e| local_err(local, e))?;

        tracing::info!("downloaded {} to {:?}", full, local);
        Ok(full)
    }

    /// Remove a single remote file, subject to the delete guards.
    pub async fn delete(
        &self,
        token: &TransferToken,
        remote_path: &str,
    ) -> Result<String, TransferError> {
        self.require(token, AccessKind::Delete)?;
        let full = remote_full_path(token, remote_path);
        check_delete_guard(&token.bucket, &full)?;

        self.store.remove_file(&full).await?;
        tracing::info!("deleted {}", full);
        Ok(full)
    }
}

fn local_err(path: impl std::fmt::Debug, source: std::io::Error) -> TransferError {
    TransferError::Local {
        path: format!("{path:?}"),
        source,
    }
}

fn remote_err(path: &str, source: std::io::Error) -> TransferError {
    TransferError::RemoteIo {
        path: path.to_string(),
        source,
    }
}

/// Which side of a copy failed; callers blame the matching endpoint.
enum CopyError {
    Read(std::io::Error),
    Write(std::io::Error),
}

/// Byte-counting copy with periodic progress logging.
async fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    label: &str,
) -> Result<u64, CopyError>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut copied: u64 = 0;
    let mut next_report = PROGRESS_STEP;

    loop {
        let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
        copied += n as u64;
        if copied >= next_report {
            tracing::debug!("{}: {}/{} bytes", label, copied, total);
            next_report += PROGRESS_STEP;
        }
    }
    writer.flush().await.map_err(CopyError::Write)?;
    Ok(copied)
}
