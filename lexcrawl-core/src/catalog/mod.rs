//! The catalog gateway: the only component that touches the catalog store.
//!
//! Workers are storage-agnostic; concurrency and retry policy for the
//! relational store live behind [`CatalogGateway`]. Two implementations
//! exist: the postgres backend used in production and an in-process
//! backend for development and the test suite.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use lexcrawl_model::{DocumentId, StorageTier};

use crate::error::Result;
use crate::gates::FailureReason;

pub use memory::MemoryCatalogGateway;
pub use postgres::PostgresCatalogGateway;

/// A catalog row still awaiting a current artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDocument {
    pub document_id: DocumentId,
    pub source_url: String,
}

/// Everything the catalog needs to record a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    /// Lowercase hex SHA-256 of the artifact bytes.
    pub content_hash: String,
    pub byte_size: u64,
    /// Path relative to the cache root.
    pub cache_path: String,
    pub storage_tier: StorageTier,
}

/// Result of a `record_success` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A new artifact row was written with this version number.
    Inserted { version: i32 },
    /// Byte-identical content was already recorded; no row was written.
    Duplicate,
}

/// Bounded, indexed access to the document catalog.
///
/// Every operation acquires and releases exactly one connection; writes run
/// in explicit transactions. A write failure after the backend's retries
/// surfaces as a per-document error; a read failure terminates the run.
#[async_trait]
pub trait CatalogGateway: Send + Sync {
    /// Documents with no current artifact row (excluded patterns skipped).
    async fn count_pending(&self) -> Result<u64>;

    /// The next batch of pending documents with ids above `after`, ordered
    /// by id ascending. An empty return means the run has drained.
    async fn fetch_pending_batch(
        &self,
        after: DocumentId,
        limit: u32,
    ) -> Result<Vec<PendingDocument>>;

    /// Insert an artifact row (version N+1), flip `is_current_version`, and
    /// bump the document's `updated_at` in one transaction. A content-hash
    /// conflict is the `Duplicate` outcome, not an error.
    async fn record_success(
        &self,
        document_id: DocumentId,
        artifact: &ArtifactMetadata,
    ) -> Result<PersistOutcome>;

    /// Log a failure for monitoring. Never modifies the catalog; failed
    /// documents stay pending for the next run.
    async fn record_failure(
        &self,
        document_id: DocumentId,
        reason: &FailureReason,
    ) -> Result<()>;
}
