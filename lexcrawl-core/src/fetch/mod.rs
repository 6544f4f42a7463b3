//! The single-document fetch state machine.
//!
//! One worker drives one `WorkItem` at a time through: rate acquisition,
//! transport fetch, the quality gates, content hashing and staging, and
//! catalog persistence. Every per-document error becomes an outcome value;
//! only cancellation propagates as an error, which the worker loop treats
//! as a signal to exit, not a failure.

pub mod http;

#[cfg(feature = "browser")]
pub mod browser;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lexcrawl_model::{DocumentId, StorageTier};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{ArtifactStore, content_hash};
use crate::catalog::{ArtifactMetadata, CatalogGateway, PersistOutcome};
use crate::classify::Verdict;
use crate::config::RetryConfig;
use crate::error::{CollectError, Result};
use crate::gates::{FailureKind, FailureReason, PayloadKind, QualityGates};
use crate::governor::{EgressId, RateGovernor};

/// One unit of work: a catalog row annotated with its classifier verdict.
/// Never persisted.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub document_id: DocumentId,
    pub source_url: String,
    pub verdict: Verdict,
    /// False when the classifier fell through to the default verdict.
    pub confident: bool,
    /// Correlates every log line and event for this document.
    pub correlation_id: Uuid,
}

/// What one HTTP exchange produced, regardless of transport.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
    pub final_url: String,
}

/// Transport seam between the state machine and the network. The direct
/// implementation wraps a reusable HTTP client; the rendered one drives a
/// pooled headless browser.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedPayload>;
}

/// Terminal result for one work item.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success {
        metadata: ArtifactMetadata,
        version: i32,
    },
    /// Byte-identical content was already recorded.
    Duplicate,
    /// The classifier ruled the URL unfetchable; nothing was attempted.
    Skipped,
    Failed {
        reason: FailureReason,
        attempts: u32,
    },
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success { .. } => "succeeded",
            FetchOutcome::Duplicate => "duplicate",
            FetchOutcome::Skipped => "skipped",
            FetchOutcome::Failed { .. } => "failed",
        }
    }
}

enum AttemptError {
    Failed(FailureReason),
    Cancelled,
}

/// Builds the transports workers fetch through. The dispatcher asks for one
/// direct transport per worker (connection reuse lives in the client) and
/// one shared rendered transport.
pub trait TransportFactory: Send + Sync {
    fn direct(&self) -> Result<Arc<dyn FetchTransport>>;
    fn rendered(&self) -> Option<Arc<dyn FetchTransport>>;
}

/// Production factory: a fresh reqwest client per worker plus an optional
/// shared browser-backed transport.
pub struct HttpTransportFactory {
    http: crate::config::HttpConfig,
    max_body_bytes: u64,
    rendered: Option<Arc<dyn FetchTransport>>,
}

impl std::fmt::Debug for HttpTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransportFactory")
            .field("has_rendered", &self.rendered.is_some())
            .finish()
    }
}

impl HttpTransportFactory {
    pub fn new(
        http: crate::config::HttpConfig,
        max_body_bytes: u64,
        rendered: Option<Arc<dyn FetchTransport>>,
    ) -> Self {
        Self {
            http,
            max_body_bytes,
            rendered,
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn direct(&self) -> Result<Arc<dyn FetchTransport>> {
        Ok(Arc::new(http::DirectFetcher::new(
            &self.http,
            self.max_body_bytes,
        )?))
    }

    fn rendered(&self) -> Option<Arc<dyn FetchTransport>> {
        self.rendered.clone()
    }
}

/// Derive the Gate 2 expectation from the URL and response headers.
pub fn expected_payload_kind(
    url: &str,
    content_type: Option<&str>,
) -> PayloadKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.to_ascii_lowercase().ends_with(".pdf") {
        return PayloadKind::Pdf;
    }
    if content_type
        .map(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
        .unwrap_or(false)
    {
        return PayloadKind::Pdf;
    }
    PayloadKind::Html
}

/// Executes the per-document state machine. One instance per worker task;
/// the direct transport's connection reuse is what makes the per-worker
/// client worthwhile.
pub struct FetchWorker {
    gateway: Arc<dyn CatalogGateway>,
    governor: Arc<RateGovernor>,
    egress: EgressId,
    direct: Arc<dyn FetchTransport>,
    rendered: Option<Arc<dyn FetchTransport>>,
    store: ArtifactStore,
    gates: QualityGates,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for FetchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchWorker")
            .field("egress", &self.egress)
            .field("has_rendered_transport", &self.rendered.is_some())
            .finish()
    }
}

impl FetchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn CatalogGateway>,
        governor: Arc<RateGovernor>,
        egress: EgressId,
        direct: Arc<dyn FetchTransport>,
        rendered: Option<Arc<dyn FetchTransport>>,
        store: ArtifactStore,
        gates: QualityGates,
        retry: RetryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            governor,
            egress,
            direct,
            rendered,
            store,
            gates,
            retry,
            shutdown,
        }
    }

    /// Run one work item to a terminal outcome. `Err` only on cancellation.
    pub async fn process(&self, item: &WorkItem) -> Result<FetchOutcome> {
        if item.verdict == Verdict::Unfetchable {
            return Ok(FetchOutcome::Skipped);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(item).await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Cancelled) => {
                    return Err(CollectError::Cancelled);
                }
                Err(AttemptError::Failed(reason)) => {
                    let rate_limited = reason.is_rate_limited();
                    if rate_limited {
                        // Throttle every worker on this egress, not just us.
                        self.governor
                            .penalize(&self.egress, self.retry.penalty_429)
                            .await;
                    }

                    let retryable = reason.kind() == FailureKind::Transient
                        && attempt <= self.retry.max_retries;
                    if !retryable {
                        self.record_failure(item, &reason).await;
                        return Ok(FetchOutcome::Failed { reason, attempts: attempt });
                    }

                    let delay = self.backoff_delay(attempt, rate_limited);
                    tracing::debug!(
                        target: "collect::fetch",
                        correlation_id = %item.correlation_id,
                        document_id = %item.document_id,
                        reason = reason.label(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(CollectError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        item: &WorkItem,
    ) -> std::result::Result<FetchOutcome, AttemptError> {
        match self.governor.acquire(&self.egress).await {
            Ok(()) => {}
            Err(CollectError::Cancelled) => return Err(AttemptError::Cancelled),
            Err(CollectError::RateLimitTimeout(_)) => {
                return Err(AttemptError::Failed(
                    FailureReason::RateLimitTimeout,
                ));
            }
            Err(other) => {
                return Err(AttemptError::Failed(FailureReason::Network {
                    detail: other.to_string(),
                }));
            }
        }

        let transport = match item.verdict {
            Verdict::Rendered => match &self.rendered {
                Some(rendered) => rendered,
                None => {
                    tracing::warn!(
                        target: "collect::fetch",
                        document_id = %item.document_id,
                        "no rendered transport available; falling back to direct"
                    );
                    &self.direct
                }
            },
            _ => &self.direct,
        };

        let payload = transport
            .fetch(&item.source_url, &self.shutdown)
            .await
            .map_err(|err| match err {
                CollectError::Cancelled => AttemptError::Cancelled,
                other => AttemptError::Failed(FailureReason::Network {
                    detail: other.to_string(),
                }),
            })?;

        // Gate 1: the HTTP exchange.
        if let Some(reason) = self.gates.check_http(
            payload.status,
            payload.bytes.len() as u64,
            payload.elapsed,
        ) {
            return Err(AttemptError::Failed(reason));
        }

        // Gate 2: payload shape.
        let kind = expected_payload_kind(
            &item.source_url,
            payload.content_type.as_deref(),
        );
        if let Some(reason) = self.gates.check_payload(kind, &payload.bytes)
        {
            return Err(AttemptError::Failed(reason));
        }

        // Hash and stage under the content address.
        let hash = content_hash(&payload.bytes);
        let stored = self
            .store
            .stage_and_commit(&hash, kind, &payload.bytes)
            .await
            .map_err(|err| {
                AttemptError::Failed(FailureReason::WriteFailed {
                    detail: err.to_string(),
                })
            })?;

        // Gate 3: write integrity.
        if let Some(reason) = self
            .gates
            .check_write(payload.bytes.len() as u64, stored.byte_size)
        {
            let _ = self.store.remove(&stored.relative_path).await;
            return Err(AttemptError::Failed(reason));
        }

        // Gate 4 is the insert outcome itself.
        let metadata = ArtifactMetadata {
            content_hash: hash,
            byte_size: stored.byte_size,
            cache_path: stored.relative_path.clone(),
            storage_tier: StorageTier::Local,
        };
        match self
            .gateway
            .record_success(item.document_id, &metadata)
            .await
        {
            Ok(PersistOutcome::Inserted { version }) => {
                tracing::info!(
                    target: "collect::fetch",
                    correlation_id = %item.correlation_id,
                    document_id = %item.document_id,
                    byte_size = metadata.byte_size,
                    version,
                    cache_path = %metadata.cache_path,
                    "artifact stored"
                );
                Ok(FetchOutcome::Success { metadata, version })
            }
            Ok(PersistOutcome::Duplicate) => {
                // Identical bytes share the content address; the staged
                // temp was already discarded by the store.
                tracing::info!(
                    target: "collect::fetch",
                    correlation_id = %item.correlation_id,
                    document_id = %item.document_id,
                    "duplicate content; no new artifact row"
                );
                Ok(FetchOutcome::Duplicate)
            }
            Err(err) => {
                let _ = self.store.remove(&stored.relative_path).await;
                Err(AttemptError::Failed(FailureReason::Persistence {
                    detail: err.to_string(),
                }))
            }
        }
    }

    async fn record_failure(&self, item: &WorkItem, reason: &FailureReason) {
        if let Err(err) = self
            .gateway
            .record_failure(item.document_id, reason)
            .await
        {
            tracing::warn!(
                target: "collect::fetch",
                document_id = %item.document_id,
                error = %err,
                "failed to record failure outcome"
            );
        }
    }

    /// Exponential backoff with jitter; 429s additionally multiply the
    /// next delay by the configured penalty.
    fn backoff_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = self
            .retry
            .backoff_factor
            .powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::rng().random_range(
            (1.0 - self.retry.jitter_ratio)..=(1.0 + self.retry.jitter_ratio),
        );
        let penalty = if rate_limited { self.retry.penalty_429 } else { 1.0 };
        self.retry.backoff_base().mul_f64(exp * jitter * penalty)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Mutex;

    use crate::catalog::MemoryCatalogGateway;
    use crate::config::{GateConfig, RateConfig};

    use super::*;

    enum Scripted {
        Status(u16),
        Pdf(usize),
        Html(&'static str),
        NetworkError,
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn pdf_bytes(len: usize) -> Vec<u8> {
            let mut bytes = b"%PDF-1.4\n".to_vec();
            bytes.resize(len, b'x');
            bytes
        }
    }

    #[async_trait]
    impl FetchTransport for ScriptedTransport {
        async fn fetch(
            &self,
            url: &str,
            _cancel: &CancellationToken,
        ) -> Result<FetchedPayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .await
                .pop_front()
                .expect("script exhausted");
            let payload = |status: u16, content_type, bytes| FetchedPayload {
                status,
                content_type,
                bytes,
                elapsed: Duration::from_millis(50),
                final_url: url.to_string(),
            };
            match step {
                Scripted::Status(status) => {
                    Ok(payload(status, None, vec![0u8; 2048]))
                }
                Scripted::Pdf(len) => Ok(payload(
                    200,
                    Some("application/pdf".to_string()),
                    Self::pdf_bytes(len),
                )),
                Scripted::Html(body) => {
                    let mut bytes = body.as_bytes().to_vec();
                    bytes.resize(bytes.len().max(2048), b' ');
                    Ok(payload(
                        200,
                        Some("text/html; charset=utf-8".to_string()),
                        bytes,
                    ))
                }
                Scripted::NetworkError => {
                    Err(CollectError::Internal("connection reset".into()))
                }
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        gateway: Arc<MemoryCatalogGateway>,
        store: ArtifactStore,
        governor: Arc<RateGovernor>,
        egress: EgressId,
        shutdown: CancellationToken,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = ArtifactStore::new(dir.path().join("cache"));
            store.ensure_layout().await.expect("layout");
            let gateway = Arc::new(MemoryCatalogGateway::new(vec![]));
            let egress = EgressId::new("test-egress");
            let shutdown = CancellationToken::new();
            let rate = RateConfig {
                egress_rate: 1_000.0,
                egress_burst: 1_000.0,
                global_rate: Some(10_000.0),
                global_burst: Some(10_000.0),
                acquire_timeout_ms: 1_000,
            };
            let governor = Arc::new(RateGovernor::new(
                &rate,
                1,
                std::slice::from_ref(&egress),
                shutdown.clone(),
            ));
            Self {
                _dir: dir,
                gateway,
                store,
                governor,
                egress,
                shutdown,
            }
        }

        fn worker(&self, transport: Arc<dyn FetchTransport>) -> FetchWorker {
            FetchWorker::new(
                Arc::clone(&self.gateway) as Arc<dyn CatalogGateway>,
                Arc::clone(&self.governor),
                self.egress.clone(),
                transport,
                None,
                self.store.clone(),
                QualityGates::new(&GateConfig::default()),
                RetryConfig::default(),
                self.shutdown.clone(),
            )
        }

        fn item(&self, id: i64, url: &str, verdict: Verdict) -> WorkItem {
            WorkItem {
                document_id: DocumentId::new(id),
                source_url: url.to_string(),
                verdict,
                confident: true,
                correlation_id: Uuid::now_v7(),
            }
        }
    }

    #[tokio::test]
    async fn direct_pdf_fetch_stores_one_row_and_one_file() {
        let fx = Fixture::new().await;
        fx.gateway
            .seed_documents([(1, "https://example.org/doc/1.pdf".to_string())])
            .await;
        let transport = ScriptedTransport::new(vec![Scripted::Pdf(2048)]);
        let worker = fx.worker(transport.clone());

        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();

        let FetchOutcome::Success { metadata, version } = outcome else {
            panic!("expected success");
        };
        assert_eq!(version, 1);
        assert_eq!(metadata.byte_size, 2048);
        assert_eq!(transport.calls(), 1);

        let rows = fx.gateway.storage_rows().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_current_version);
        assert_eq!(rows[0].cache_path, metadata.cache_path);

        let on_disk = tokio::fs::read(
            fx.store.absolute_path(&metadata.cache_path),
        )
        .await
        .unwrap();
        assert_eq!(content_hash(&on_disk), metadata.content_hash);
        assert_eq!(on_disk.len() as u64, metadata.byte_size);
    }

    #[tokio::test]
    async fn unfetchable_items_never_touch_the_network() {
        let fx = Fixture::new().await;
        let transport = ScriptedTransport::new(vec![]);
        let worker = fx.worker(transport.clone());

        let outcome = worker
            .process(&fx.item(
                1,
                "https://example.org/docfragment/1",
                Verdict::Unfetchable,
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, FetchOutcome::Skipped));
        assert_eq!(transport.calls(), 0);
        assert!(fx.gateway.storage_rows().await.is_empty());
    }

    #[tokio::test]
    async fn http_404_is_terminal_and_not_retried() {
        let fx = Fixture::new().await;
        let transport = ScriptedTransport::new(vec![Scripted::Status(404)]);
        let worker = fx.worker(transport.clone());

        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();

        let FetchOutcome::Failed { reason, attempts } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailureReason::HttpStatus { status: 404 });
        assert_eq!(attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert!(fx.gateway.storage_rows().await.is_empty());
        assert_eq!(fx.gateway.failures().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn http_429_backs_off_then_succeeds() {
        let fx = Fixture::new().await;
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(429),
            Scripted::Status(429),
            Scripted::Pdf(4096),
        ]);
        let worker = fx.worker(transport.clone());
        let start = tokio::time::Instant::now();

        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();

        assert!(matches!(outcome, FetchOutcome::Success { .. }));
        assert_eq!(transport.calls(), 3);
        // Two penalized backoffs: at least base*4*(1-j) + base*2*4*(1-j).
        assert!(start.elapsed() >= Duration::from_secs_f64(3.0 + 6.0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_network_errors_exhaust_retries() {
        let fx = Fixture::new().await;
        let transport = ScriptedTransport::new(vec![
            Scripted::NetworkError,
            Scripted::NetworkError,
            Scripted::NetworkError,
            Scripted::NetworkError,
        ]);
        let worker = fx.worker(transport.clone());

        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();

        let FetchOutcome::Failed { reason, attempts } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason.label(), "network");
        assert_eq!(attempts, RetryConfig::default().max_retries + 1);
        assert_eq!(transport.calls(), 4);
        assert!(fx.gateway.storage_rows().await.is_empty());
    }

    #[tokio::test]
    async fn tiny_payload_fails_the_http_gate() {
        let fx = Fixture::new().await;
        let transport = ScriptedTransport::new(vec![Scripted::Pdf(128)]);
        let worker = fx.worker(transport);

        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();

        let FetchOutcome::Failed { reason, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason.label(), "too_small");
        assert!(fx.gateway.storage_rows().await.is_empty());
    }

    #[tokio::test]
    async fn html_payload_for_pdf_url_fails_the_payload_gate() {
        let fx = Fixture::new().await;
        let transport =
            ScriptedTransport::new(vec![Scripted::Html("<html>not a pdf</html>")]);
        let worker = fx.worker(transport);

        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();

        let FetchOutcome::Failed { reason, attempts } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailureReason::NotPdf);
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn byte_identical_content_collapses_to_duplicate() {
        let fx = Fixture::new().await;
        fx.gateway
            .seed_documents([
                (1, "https://example.org/doc/1.pdf".to_string()),
                (2, "https://example.org/doc/2.pdf".to_string()),
            ])
            .await;

        let first = ScriptedTransport::new(vec![Scripted::Pdf(2048)]);
        let worker = fx.worker(first);
        let outcome = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Success { .. }));

        let second = ScriptedTransport::new(vec![Scripted::Pdf(2048)]);
        let worker = fx.worker(second);
        let outcome = worker
            .process(&fx.item(2, "https://example.org/doc/2.pdf", Verdict::Direct))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Duplicate));

        // One row, one file, no staging residue.
        assert_eq!(fx.gateway.storage_rows().await.len(), 1);
        let mut tmp_entries =
            tokio::fs::read_dir(fx.store.root().join(".tmp")).await.unwrap();
        assert!(tmp_entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_error_not_outcome() {
        let fx = Fixture::new().await;
        fx.shutdown.cancel();
        let transport = ScriptedTransport::new(vec![Scripted::Pdf(2048)]);
        let worker = fx.worker(transport);

        let err = worker
            .process(&fx.item(1, "https://example.org/doc/1.pdf", Verdict::Direct))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn payload_kind_follows_url_then_content_type() {
        assert_eq!(
            expected_payload_kind("https://x.org/a.PDF?dl=1", None),
            PayloadKind::Pdf
        );
        assert_eq!(
            expected_payload_kind(
                "https://x.org/doc/9",
                Some("application/pdf")
            ),
            PayloadKind::Pdf
        );
        assert_eq!(
            expected_payload_kind("https://x.org/doc/9", Some("text/html")),
            PayloadKind::Html
        );
    }
}
