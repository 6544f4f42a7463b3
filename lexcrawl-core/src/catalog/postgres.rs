use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lexcrawl_model::{DocumentId, UploadStatus};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::Result;
use crate::gates::FailureReason;

use super::{
    ArtifactMetadata, CatalogGateway, PendingDocument, PersistOutcome,
};

const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PostgresCatalogGateway {
    pool: PgPool,
    /// SQL LIKE patterns (`%...%`) excluded from pending queries.
    excluded_like: Vec<String>,
    run_id: Uuid,
}

impl PostgresCatalogGateway {
    /// Connect with a pool sized for the worker count: one connection per
    /// worker plus headroom for the dispatcher's reads.
    pub async fn connect(
        database_url: &str,
        workers: usize,
        excluded_substrings: Vec<String>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections((workers + 2) as u32)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, excluded_substrings))
    }

    pub fn new(pool: PgPool, excluded_substrings: Vec<String>) -> Self {
        let excluded_like = excluded_substrings
            .into_iter()
            .map(|needle| format!("%{needle}%"))
            .collect();
        Self {
            pool,
            excluded_like,
            run_id: Uuid::now_v7(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn is_retryable(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => matches!(
                db.code().as_deref(),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01")
            ),
            _ => false,
        }
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db)
                if db.code().as_deref() == Some("23505")
        )
    }

    /// Bounded exponential backoff around serialization/deadlock errors.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut delay = WRITE_RETRY_BASE;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= WRITE_RETRY_ATTEMPTS
                        || !Self::is_retryable(&err)
                    {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        target: "collect::catalog",
                        error = %err,
                        attempt,
                        "retrying catalog operation"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn insert_artifact(
        &self,
        document_id: DocumentId,
        artifact: &ArtifactMetadata,
    ) -> std::result::Result<i32, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let previous: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(version_number), 0)
            FROM file_storage
            WHERE document_id = $1
            "#,
        )
        .bind(document_id.as_i64())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE file_storage
            SET is_current_version = FALSE, updated_at = NOW()
            WHERE document_id = $1 AND is_current_version = TRUE
            "#,
        )
        .bind(document_id.as_i64())
        .execute(&mut *tx)
        .await?;

        let version = previous + 1;
        sqlx::query(
            r#"
            INSERT INTO file_storage (
                document_id, version_number, content_hash, byte_size,
                storage_tier, cache_path, upload_status, is_current_version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
            "#,
        )
        .bind(document_id.as_i64())
        .bind(version)
        .bind(&artifact.content_hash)
        .bind(artifact.byte_size as i64)
        .bind(artifact.storage_tier.as_str())
        .bind(&artifact.cache_path)
        .bind(UploadStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE documents SET updated_at = NOW() WHERE id = $1",
        )
        .bind(document_id.as_i64())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(version)
    }
}

#[async_trait]
impl CatalogGateway for PostgresCatalogGateway {
    async fn count_pending(&self) -> Result<u64> {
        let count: i64 = self
            .with_retry(|| {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*)
                    FROM documents d
                    WHERE NOT EXISTS (
                        SELECT 1 FROM file_storage fs
                        WHERE fs.document_id = d.id
                          AND fs.is_current_version
                    )
                    AND NOT (d.source_url LIKE ANY($1))
                    "#,
                )
                .bind(&self.excluded_like)
                .fetch_one(&self.pool)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_pending_batch(
        &self,
        after: DocumentId,
        limit: u32,
    ) -> Result<Vec<PendingDocument>> {
        let rows = self
            .with_retry(|| {
                sqlx::query(
                    r#"
                    SELECT d.id, d.source_url
                    FROM documents d
                    WHERE d.id > $1
                    AND NOT EXISTS (
                        SELECT 1 FROM file_storage fs
                        WHERE fs.document_id = d.id
                          AND fs.is_current_version
                    )
                    AND NOT (d.source_url LIKE ANY($2))
                    ORDER BY d.id ASC
                    LIMIT $3
                    "#,
                )
                .bind(after.as_i64())
                .bind(&self.excluded_like)
                .bind(limit as i64)
                .fetch_all(&self.pool)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| PendingDocument {
                document_id: DocumentId::new(row.get::<i64, _>("id")),
                source_url: row.get("source_url"),
            })
            .collect())
    }

    async fn record_success(
        &self,
        document_id: DocumentId,
        artifact: &ArtifactMetadata,
    ) -> Result<PersistOutcome> {
        let mut delay = WRITE_RETRY_BASE;
        let mut attempt = 0;
        loop {
            match self.insert_artifact(document_id, artifact).await {
                Ok(version) => {
                    return Ok(PersistOutcome::Inserted { version });
                }
                Err(err) if Self::is_unique_violation(&err) => {
                    return Ok(PersistOutcome::Duplicate);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= WRITE_RETRY_ATTEMPTS
                        || !Self::is_retryable(&err)
                    {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        target: "collect::catalog",
                        document_id = %document_id,
                        error = %err,
                        attempt,
                        "retrying artifact insert"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
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

        // Per-run failure rows are monitoring data; losing one is not
        // worth failing the document over.
        if let Err(err) = sqlx::query(
            r#"
            INSERT INTO fetch_failures (run_id, document_id, reason, detail)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(self.run_id)
        .bind(document_id.as_i64())
        .bind(reason.label())
        .bind(reason.to_string())
        .execute(&self.pool)
        .await
        {
            tracing::warn!(
                target: "collect::catalog",
                error = %err,
                "failed to record fetch failure row"
            );
        }
        Ok(())
    }
}
