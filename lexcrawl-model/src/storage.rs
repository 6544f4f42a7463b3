use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DocumentId, FileStorageId};

/// Where an artifact's bytes currently live.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Local,
    Remote,
    Both,
}

impl StorageTier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Local => "local",
            StorageTier::Remote => "remote",
            StorageTier::Both => "both",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(StorageTier::Local),
            "remote" => Some(StorageTier::Remote),
            "both" => Some(StorageTier::Both),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload-intent state for the remote tier. The core only ever writes
/// `Pending`; the upload pipeline advances it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Completed,
    Failed,
}

impl UploadStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(UploadStatus::Pending),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored artifact version for a document.
///
/// Exactly one row per document carries `is_current_version = true` among
/// its successful rows; the pair `(document_id, content_hash)` and the
/// `content_hash` alone are unique at the storage layer.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStorageRecord {
    pub id: FileStorageId,
    pub document_id: DocumentId,
    pub version_number: i32,
    /// Lowercase hex SHA-256 of the artifact bytes.
    pub content_hash: String,
    pub byte_size: i64,
    pub storage_tier: StorageTier,
    /// Path relative to the content-addressed cache root.
    pub cache_path: String,
    pub upload_status: UploadStatus,
    pub is_current_version: bool,
    /// Filled by the downstream extraction pipeline; the core leaves it NULL.
    pub quality_tier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for FileStorageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorageRecord")
            .field("id", &self.id)
            .field("document_id", &self.document_id)
            .field("version_number", &self.version_number)
            .field("content_hash", &self.content_hash)
            .field("byte_size", &self.byte_size)
            .field("storage_tier", &self.storage_tier)
            .field("cache_path", &self.cache_path)
            .field("is_current_version", &self.is_current_version)
            .finish()
    }
}
