//! Content-addressed artifact store.
//!
//! Artifacts live at `<aa>/<bb>/<hash>.<ext>` under a configurable root,
//! where `aa`/`bb` are the first two hex byte-pairs of the lowercase
//! SHA-256. In-progress writes go to a sibling `.tmp/` directory and are
//! atomically renamed into place; if the final path already exists the
//! temp file is discarded, which doubles as the duplicate cleanup (a
//! byte-identical artifact maps to the same path).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sysinfo::Disks;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{CollectError, Result};
use crate::gates::PayloadKind;

const TMP_DIR: &str = ".tmp";

/// Compute the lowercase hex SHA-256 of an artifact's bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Outcome of a successful stage-and-commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Path relative to the cache root, as recorded in the catalog.
    pub relative_path: String,
    pub byte_size: u64,
}

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative cache path for a hash: `aa/bb/<hash>.<ext>`.
    pub fn relative_path(hash: &str, kind: PayloadKind) -> String {
        format!("{}/{}/{hash}.{}", &hash[0..2], &hash[2..4], kind.extension())
    }

    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Create the root and staging directories; fatal at startup when the
    /// root is unreachable.
    pub async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join(TMP_DIR))
            .await
            .map_err(|err| {
                CollectError::Internal(format!(
                    "cache root {:?} is not writable: {err}",
                    self.root
                ))
            })
    }

    /// Write `bytes` to a temp path, fsync, and atomically rename to the
    /// content address. Returns the stored size actually observed on disk
    /// so the write-integrity gate can compare it.
    pub async fn stage_and_commit(
        &self,
        hash: &str,
        kind: PayloadKind,
        bytes: &[u8],
    ) -> Result<StoredArtifact> {
        let relative = Self::relative_path(hash, kind);
        let target = self.absolute_path(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{hash}.{}", Uuid::new_v4().simple()));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        let on_disk = file.metadata().await?.len();
        drop(file);

        if on_disk != bytes.len() as u64 {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CollectError::Internal(format!(
                "staged file {tmp:?} is {on_disk} bytes, expected {}",
                bytes.len()
            )));
        }

        // Identical content already committed; ours is redundant.
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Ok(StoredArtifact {
                relative_path: relative,
                byte_size: on_disk,
            });
        }

        tokio::fs::rename(&tmp, &target).await?;
        Ok(StoredArtifact {
            relative_path: relative,
            byte_size: on_disk,
        })
    }

    /// Remove a committed artifact. Used when a success could not be
    /// recorded and the bytes must not linger.
    pub async fn remove(&self, relative: &str) -> Result<()> {
        let path = self.absolute_path(relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Free bytes on the filesystem holding the cache root. Probed on an
    /// interval by the dispatcher's free-space guard.
    pub fn available_space(&self) -> Option<u64> {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}
