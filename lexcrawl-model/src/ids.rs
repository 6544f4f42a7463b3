use serde::{Deserialize, Serialize};

/// Strongly typed surrogate key for catalog documents.
///
/// The catalog assigns these; the collection engine never mints one.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct DocumentId(pub i64);

impl DocumentId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for DocumentId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surrogate key for artifact rows in `file_storage`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct FileStorageId(pub i64);

impl FileStorageId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FileStorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
