//! Append-only audit log of authorized transfer actions, one JSON record
//! per line. Records are never mutated or deleted by this system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::vault::restrict_permissions;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit log i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    Upload,
    Download,
    Delete,
    UploadFolder,
    DeleteFolder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: Uuid,
    pub token_id: Uuid,
    pub action: TransferAction,
    pub remote_path: String,
    /// Not meaningful for deletes.
    pub local_path: Option<String>,
}

impl AuditEntry {
    pub fn new(
        user_id: Uuid,
        token_id: Uuid,
        action: TransferAction,
        remote_path: impl Into<String>,
        local_path: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id,
            token_id,
            action,
            remote_path: remote_path.into(),
            local_path,
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        restrict_permissions(&self.path)?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        tracing::debug!(
            "audited {:?} of {} by token {}",
            entry.action,
            entry.remote_path,
            entry.token_id
        );
        Ok(())
    }

    /// All recorded entries, oldest first.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}
