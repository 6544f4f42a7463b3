//! Crash-safe progress tracking.
//!
//! A single rolling JSON record at `<checkpoint_dir>/progress.json`,
//! written via temp-file + fsync + atomic rename. The checkpoint is a
//! monitoring artifact: resume re-consults the catalog and never trusts
//! it to skip work.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duplicate: u64,
    /// Highest document id the dispatcher has observed (not necessarily
    /// completed); monotonically nondecreasing within a run.
    pub last_document_id: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn start(total: u64) -> Self {
        let now = Utc::now();
        Self {
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            duplicate: 0,
            last_document_id: 0,
            started_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the previous checkpoint if present. A record that fails to
    /// parse is archived with a timestamp suffix rather than guessed at.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<Checkpoint>(&raw) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(err) => {
                let archive = self.path.with_extension(format!(
                    "json.corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                tracing::warn!(
                    target: "collect::checkpoint",
                    error = %err,
                    archive = %archive.display(),
                    "checkpoint unreadable; archiving and starting fresh"
                );
                tokio::fs::rename(&self.path, &archive).await?;
                Ok(None)
            }
        }
    }

    /// Serialize to `progress.json.tmp`, fsync, and rename over the live
    /// record so a crash can never leave a torn checkpoint.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&payload).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            CheckpointStore::new(dir.path().join("progress.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn missing_checkpoint_loads_as_none() {
        let (_dir, store) = store();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let (_dir, store) = store();
        let mut checkpoint = Checkpoint::start(1_000);
        checkpoint.processed = 250;
        checkpoint.succeeded = 200;
        checkpoint.failed = 30;
        checkpoint.skipped = 15;
        checkpoint.duplicate = 5;
        checkpoint.last_document_id = 4_321;

        store.write(&checkpoint).await.unwrap();
        let loaded = store.load().await.unwrap().expect("present");
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_record() {
        let (_dir, store) = store();
        let mut checkpoint = Checkpoint::start(10);
        store.write(&checkpoint).await.unwrap();
        checkpoint.processed = 10;
        store.write(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap().expect("present");
        assert_eq!(loaded.processed, 10);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_archived_and_ignored() {
        let (dir, store) = store();
        tokio::fs::write(store.path(), b"{ not json").await.unwrap();

        assert_eq!(store.load().await.unwrap(), None);
        assert!(!store.path().exists());

        let mut archived = 0;
        let mut entries =
            tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("corrupt") {
                archived += 1;
            }
        }
        assert_eq!(archived, 1);
    }
}
