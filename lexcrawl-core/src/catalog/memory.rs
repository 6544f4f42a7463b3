//! In-process catalog backend.
//!
//! Mirrors the postgres gateway's observable behaviour (pending queries,
//! version flips, hash uniqueness as an insert property) over a plain
//! in-memory map, for development against small seed sets and for the
//! test suite.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use lexcrawl_model::{
    DocumentId, FileStorageId, FileStorageRecord, UploadStatus,
};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::gates::FailureReason;

use super::{
    ArtifactMetadata, CatalogGateway, PendingDocument, PersistOutcome,
};

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<i64, String>,
    storage: Vec<FileStorageRecord>,
    failures: Vec<(DocumentId, String)>,
    next_row_id: i64,
}

impl State {
    fn has_current_row(&self, document_id: DocumentId) -> bool {
        self.storage
            .iter()
            .any(|row| row.document_id == document_id && row.is_current_version)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalogGateway {
    excluded_substrings: Vec<String>,
    state: Mutex<State>,
}

impl MemoryCatalogGateway {
    pub fn new(excluded_substrings: Vec<String>) -> Self {
        Self {
            excluded_substrings,
            state: Mutex::new(State::default()),
        }
    }

    /// Seed catalog rows, as the external seed collector would.
    pub async fn seed_documents<I>(&self, rows: I)
    where
        I: IntoIterator<Item = (i64, String)>,
    {
        let mut state = self.state.lock().await;
        for (id, url) in rows {
            state.documents.insert(id, url);
        }
    }

    pub async fn storage_rows(&self) -> Vec<FileStorageRecord> {
        self.state.lock().await.storage.clone()
    }

    pub async fn failures(&self) -> Vec<(DocumentId, String)> {
        self.state.lock().await.failures.clone()
    }

    fn excluded(&self, url: &str) -> bool {
        self.excluded_substrings
            .iter()
            .any(|needle| url.contains(needle.as_str()))
    }
}

#[async_trait]
impl CatalogGateway for MemoryCatalogGateway {
    async fn count_pending(&self) -> Result<u64> {
        let state = self.state.lock().await;
        let count = state
            .documents
            .iter()
            .filter(|(id, url)| {
                !state.has_current_row(DocumentId::new(**id))
                    && !self.excluded(url)
            })
            .count();
        Ok(count as u64)
    }

    async fn fetch_pending_batch(
        &self,
        after: DocumentId,
        limit: u32,
    ) -> Result<Vec<PendingDocument>> {
        let state = self.state.lock().await;
        let batch = state
            .documents
            .range(after.as_i64() + 1..)
            .filter(|(id, url)| {
                !state.has_current_row(DocumentId::new(**id))
                    && !self.excluded(url)
            })
            .take(limit as usize)
            .map(|(id, url)| PendingDocument {
                document_id: DocumentId::new(*id),
                source_url: url.clone(),
            })
            .collect();
        Ok(batch)
    }

    async fn record_success(
        &self,
        document_id: DocumentId,
        artifact: &ArtifactMetadata,
    ) -> Result<PersistOutcome> {
        let mut state = self.state.lock().await;

        // Hash uniqueness is a property of insert: both the global hash
        // index and the (document, hash) pair reject byte-identical
        // content.
        let conflict = state
            .storage
            .iter()
            .any(|row| row.content_hash == artifact.content_hash);
        if conflict {
            return Ok(PersistOutcome::Duplicate);
        }

        let version = state
            .storage
            .iter()
            .filter(|row| row.document_id == document_id)
            .map(|row| row.version_number)
            .max()
            .unwrap_or(0)
            + 1;

        for row in state
            .storage
            .iter_mut()
            .filter(|row| row.document_id == document_id)
        {
            row.is_current_version = false;
            row.updated_at = Utc::now();
        }

        state.next_row_id += 1;
        let now = Utc::now();
        let record = FileStorageRecord {
            id: FileStorageId::new(state.next_row_id),
            document_id,
            version_number: version,
            content_hash: artifact.content_hash.clone(),
            byte_size: artifact.byte_size as i64,
            storage_tier: artifact.storage_tier,
            cache_path: artifact.cache_path.clone(),
            upload_status: UploadStatus::Pending,
            is_current_version: true,
            quality_tier: None,
            created_at: now,
            updated_at: now,
        };
        state.storage.push(record);
        Ok(PersistOutcome::Inserted { version })
    }

    async fn record_failure(
        &self,
        document_id: DocumentId,
        reason: &FailureReason,
    ) -> Result<()> {
        tracing::warn!(
            target: "collect::catalog",
            document_id = %document_id,
            reason = reason.label(),
            detail = %reason,
            "document failed"
        );
        let mut state = self.state.lock().await;
        state
            .failures
            .push((document_id, reason.label().to_string()));
        Ok(())
    }
}
