//! Core data model definitions shared across lexcrawl crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod document;
pub mod ids;
pub mod storage;

// Intentionally curated re-exports for downstream consumers.
pub use document::Document;
pub use ids::{DocumentId, FileStorageId};
pub use storage::{FileStorageRecord, StorageTier, UploadStatus};
