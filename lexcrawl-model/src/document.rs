use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DocumentId;

/// A catalog row describing one known document.
///
/// Rows are created by the seed collector. The collection engine treats them
/// as immutable apart from `updated_at`, which is bumped whenever a new
/// artifact version is recorded.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    /// Originating site key, e.g. `saflii` or `austlii`.
    pub source_site: String,
    /// The URL the artifact is fetched from.
    pub source_url: String,
    pub title: String,
    pub year: Option<i32>,
    /// Free-form document type tag (`judgment`, `gazette`, ...).
    pub doc_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("source_site", &self.source_site)
            .field("source_url", &self.source_url)
            .field("title", &self.title)
            .field("year", &self.year)
            .field("doc_type", &self.doc_type)
            .finish()
    }
}
