//! End-to-end collection runs against the in-process catalog backend and
//! scripted transports: full dispatcher wiring, real artifact store and
//! checkpoint files, no network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lexcrawl_core::{
    ArtifactStore, CatalogGateway, CheckpointStore, CollectError,
    CollectorConfig, CollectorServices, Dispatcher, EgressId,
    FetchTransport, FetchedPayload, MemoryCatalogGateway, RateGovernor,
    Result, RoundRobinSelector, TransportFactory, UrlClassifier,
    content_hash,
};

#[derive(Clone)]
enum Canned {
    Pdf(Vec<u8>),
    Status(u16),
    DelayedPdf(Duration, Vec<u8>),
}

fn pdf_bytes(seed: u8, len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.push(seed);
    bytes.resize(len, b'x');
    bytes
}

/// Shared transport stub: canned responses keyed by URL, with a timestamped
/// call log for rate assertions.
struct CannedTransport {
    responses: HashMap<String, Canned>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl CannedTransport {
    fn new(responses: HashMap<String, Canned>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: Mutex::new(Vec::new()),
        })
    }

    async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    async fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().await.iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl FetchTransport for CannedTransport {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedPayload> {
        self.calls
            .lock()
            .await
            .push((url.to_string(), Instant::now()));
        let canned = self
            .responses
            .get(url)
            .unwrap_or_else(|| panic!("no canned response for {url}"))
            .clone();
        let respond = |status: u16, bytes: Vec<u8>| FetchedPayload {
            status,
            content_type: Some("application/pdf".to_string()),
            bytes,
            elapsed: Duration::from_millis(20),
            final_url: url.to_string(),
        };
        match canned {
            Canned::Pdf(bytes) => Ok(respond(200, bytes)),
            Canned::Status(status) => Ok(respond(status, vec![0u8; 2048])),
            Canned::DelayedPdf(delay, bytes) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(CollectError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(respond(200, bytes)),
                }
            }
        }
    }
}

struct CannedFactory {
    transport: Arc<CannedTransport>,
}

impl TransportFactory for CannedFactory {
    fn direct(&self) -> Result<Arc<dyn FetchTransport>> {
        Ok(Arc::clone(&self.transport) as Arc<dyn FetchTransport>)
    }

    fn rendered(&self) -> Option<Arc<dyn FetchTransport>> {
        None
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config: CollectorConfig,
    gateway: Arc<MemoryCatalogGateway>,
    transport: Arc<CannedTransport>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(
        workers: usize,
        responses: HashMap<String, Canned>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = CollectorConfig::default();
        config.run.workers = workers;
        config.run.batch_size = 5;
        config.run.checkpoint_interval = 1;
        config.run.report_interval_secs = 3600;
        config.run.shutdown_grace_secs = 10;
        config.rate.egress_rate = 10_000.0;
        config.rate.egress_burst = 10_000.0;
        config.retry.backoff_base_ms = 10;
        config.cache.root = dir.path().join("cache");
        config.cache.min_free_bytes = 0;
        config.checkpoint.dir = dir.path().join("checkpoints");

        let gateway = Arc::new(MemoryCatalogGateway::new(
            UrlClassifier::from_config(&config.classifier)
                .expect("rules compile")
                .unfetchable_substrings(),
        ));
        let transport = CannedTransport::new(responses);
        Self {
            _dir: dir,
            config,
            gateway,
            transport,
            shutdown: CancellationToken::new(),
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        let classifier = Arc::new(
            UrlClassifier::from_config(&self.config.classifier)
                .expect("rules compile"),
        );
        let identities: Vec<EgressId> = self
            .config
            .egress_pool()
            .iter()
            .map(EgressId::new)
            .collect();
        let governor = Arc::new(RateGovernor::new(
            &self.config.rate,
            self.config.run.workers,
            &identities,
            self.shutdown.clone(),
        ));
        let services = CollectorServices {
            gateway: Arc::clone(&self.gateway) as Arc<dyn CatalogGateway>,
            classifier,
            governor,
            selector: Arc::new(RoundRobinSelector::new(identities)),
            transports: Arc::new(CannedFactory {
                transport: Arc::clone(&self.transport),
            }),
            store: ArtifactStore::new(self.config.cache.root.clone()),
            checkpoints: CheckpointStore::new(
                self.config.checkpoint.progress_path(),
            ),
            events: Arc::new(Default::default()),
        };
        Dispatcher::new(self.config.clone(), services, self.shutdown.clone())
    }

    fn store(&self) -> ArtifactStore {
        ArtifactStore::new(self.config.cache.root.clone())
    }
}

#[tokio::test]
async fn single_direct_pdf_end_to_end() {
    let url = "https://example.org/doc/1.pdf";
    let bytes = pdf_bytes(1, 2048);
    let harness = Harness::new(
        2,
        HashMap::from([(url.to_string(), Canned::Pdf(bytes.clone()))]),
    );
    harness.gateway.seed_documents([(1, url.to_string())]).await;

    let summary = harness.dispatcher().run().await.expect("run ok");

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert!(!summary.interrupted);

    let rows = harness.gateway.storage_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].byte_size, 2048);
    assert!(rows[0].is_current_version);
    assert_eq!(rows[0].content_hash, content_hash(&bytes));

    let on_disk = tokio::fs::read(
        harness.store().absolute_path(&rows[0].cache_path),
    )
    .await
    .expect("artifact present");
    assert_eq!(on_disk, bytes);
}

#[tokio::test]
async fn fragment_urls_are_skipped_without_network() {
    let url = "https://example.org/docfragment/1";
    let harness = Harness::new(2, HashMap::new());
    harness.gateway.seed_documents([(1, url.to_string())]).await;

    let summary = harness.dispatcher().run().await.expect("run ok");

    // The gateway itself filters fragment URLs out of pending batches, so
    // nothing is handled and nothing touches the transport.
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.processed, 0);
    assert_eq!(harness.transport.call_count().await, 0);
    assert!(harness.gateway.storage_rows().await.is_empty());
}

#[tokio::test]
async fn unfiltered_fragment_urls_count_as_skipped() {
    // Same scenario but with a gateway that does not pre-filter, to pin
    // down the classifier path in the feeder.
    let url = "https://example.org/docfragment/2";
    let harness = Harness::new(2, HashMap::new());
    let gateway = Arc::new(MemoryCatalogGateway::new(vec![]));
    gateway.seed_documents([(1, url.to_string())]).await;

    let classifier = Arc::new(
        UrlClassifier::from_config(&harness.config.classifier).unwrap(),
    );
    let identities = vec![EgressId::new("default")];
    let governor = Arc::new(RateGovernor::new(
        &harness.config.rate,
        2,
        &identities,
        harness.shutdown.clone(),
    ));
    let services = CollectorServices {
        gateway: Arc::clone(&gateway) as Arc<dyn CatalogGateway>,
        classifier,
        governor,
        selector: Arc::new(RoundRobinSelector::new(identities)),
        transports: Arc::new(CannedFactory {
            transport: Arc::clone(&harness.transport),
        }),
        store: harness.store(),
        checkpoints: CheckpointStore::new(
            harness.config.checkpoint.progress_path(),
        ),
        events: Arc::new(Default::default()),
    };
    let dispatcher = Dispatcher::new(
        harness.config.clone(),
        services,
        harness.shutdown.clone(),
    );

    let summary = dispatcher.run().await.expect("run ok");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(harness.transport.call_count().await, 0);
    assert!(gateway.storage_rows().await.is_empty());
}

#[tokio::test]
async fn duplicate_content_collapses_to_one_row() {
    let url_a = "https://example.org/doc/1.pdf";
    let url_b = "https://example.org/doc/2.pdf";
    let bytes = pdf_bytes(7, 4096);
    let harness = Harness::new(
        2,
        HashMap::from([
            (url_a.to_string(), Canned::Pdf(bytes.clone())),
            (url_b.to_string(), Canned::Pdf(bytes.clone())),
        ]),
    );
    harness
        .gateway
        .seed_documents([(1, url_a.to_string()), (2, url_b.to_string())])
        .await;

    let summary = harness.dispatcher().run().await.expect("run ok");

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.duplicate, 1);
    assert_eq!(harness.gateway.storage_rows().await.len(), 1);
}

#[tokio::test]
async fn terminal_failures_are_counted_and_reported() {
    let ok = "https://example.org/doc/1.pdf";
    let gone = "https://example.org/doc/2.pdf";
    let harness = Harness::new(
        2,
        HashMap::from([
            (ok.to_string(), Canned::Pdf(pdf_bytes(3, 2048))),
            (gone.to_string(), Canned::Status(404)),
        ]),
    );
    harness
        .gateway
        .seed_documents([(1, ok.to_string()), (2, gone.to_string())])
        .await;

    let summary = harness.dispatcher().run().await.expect("run ok");

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.top_failures, vec![("http_4xx".to_string(), 1)]);
    assert_eq!(harness.gateway.failures().await.len(), 1);
    assert_eq!(harness.gateway.storage_rows().await.len(), 1);
}

#[tokio::test]
async fn resume_after_terminal_failure_keeps_total_bounded() {
    let ok_a = "https://example.org/doc/1.pdf";
    let gone = "https://example.org/doc/2.pdf";
    let ok_b = "https://example.org/doc/3.pdf";
    let harness = Harness::new(
        2,
        HashMap::from([
            (ok_a.to_string(), Canned::Pdf(pdf_bytes(1, 2048))),
            (gone.to_string(), Canned::Status(404)),
            (ok_b.to_string(), Canned::Pdf(pdf_bytes(2, 2048))),
        ]),
    );
    harness
        .gateway
        .seed_documents([
            (1, ok_a.to_string()),
            (2, gone.to_string()),
            (3, ok_b.to_string()),
        ])
        .await;

    let first = harness.dispatcher().run().await.expect("run ok");
    assert_eq!(first.total, 3);
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);

    // The failed document is still pending, so the resumed run counts it
    // once through the catalog, not a second time through the carried
    // checkpoint: total stays at the catalog size on every resume.
    let second = harness.dispatcher().run().await.expect("resume ok");
    assert_eq!(second.total, 3);
    assert_eq!(second.processed, 1);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.failed, 1);

    let third = harness.dispatcher().run().await.expect("second resume ok");
    assert_eq!(third.total, 3);

    let checkpoint = CheckpointStore::new(
        harness.config.checkpoint.progress_path(),
    )
    .load()
    .await
    .expect("load ok")
    .expect("checkpoint written");
    assert_eq!(checkpoint.total, 3);
    assert_eq!(harness.gateway.storage_rows().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_drains_within_grace_and_resume_completes() {
    let urls: Vec<String> = (1..=10)
        .map(|i| format!("https://example.org/doc/{i}.pdf"))
        .collect();
    let responses: HashMap<String, Canned> = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            (
                url.clone(),
                Canned::DelayedPdf(
                    Duration::from_secs(1),
                    pdf_bytes(i as u8, 2048 + i),
                ),
            )
        })
        .collect();
    let harness = Harness::new(2, responses);
    harness
        .gateway
        .seed_documents(
            urls.iter()
                .enumerate()
                .map(|(i, url)| ((i + 1) as i64, url.clone())),
        )
        .await;

    let dispatcher = harness.dispatcher();
    let shutdown = harness.shutdown.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
    });

    let summary = dispatcher.run().await.expect("run ok");
    canceller.await.unwrap();

    assert!(summary.interrupted);
    assert!(summary.processed < 10);

    let checkpoint = CheckpointStore::new(
        harness.config.checkpoint.progress_path(),
    )
    .load()
    .await
    .expect("load ok")
    .expect("checkpoint written");
    assert!(checkpoint.processed <= 10);
    assert_eq!(checkpoint.processed, summary.processed);

    // Restart with a fresh cancellation token; the run must finish the
    // remainder using the catalog, not the checkpoint.
    let resumed = Harness {
        _dir: harness._dir,
        config: harness.config.clone(),
        gateway: Arc::clone(&harness.gateway),
        transport: Arc::clone(&harness.transport),
        shutdown: CancellationToken::new(),
    };
    let summary = resumed.dispatcher().run().await.expect("resume ok");
    assert!(!summary.interrupted);

    let rows = resumed.gateway.storage_rows().await;
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|row| row.is_current_version));
}

#[tokio::test(start_paused = true)]
async fn egress_rate_ceiling_holds_across_workers() {
    let urls: Vec<String> = (1..=40)
        .map(|i| format!("https://example.org/doc/{i}.pdf"))
        .collect();
    let responses: HashMap<String, Canned> = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            (url.clone(), Canned::Pdf(pdf_bytes(i as u8, 2048 + i)))
        })
        .collect();

    let mut harness = Harness::new(4, responses);
    harness.config.rate.egress_rate = 2.0;
    harness.config.rate.egress_burst = 2.0;
    harness.config.rate.global_rate = Some(1_000.0);
    harness.config.rate.global_burst = Some(1_000.0);
    harness
        .gateway
        .seed_documents(
            urls.iter()
                .enumerate()
                .map(|(i, url)| ((i + 1) as i64, url.clone())),
        )
        .await;

    let summary = harness.dispatcher().run().await.expect("run ok");
    assert_eq!(summary.succeeded, 40);

    let times = harness.transport.call_times().await;
    assert_eq!(times.len(), 40);
    for (i, start) in times.iter().enumerate() {
        let in_window = times
            .iter()
            .filter(|t| {
                **t >= *start
                    && t.duration_since(*start) < Duration::from_secs(1)
            })
            .count();
        assert!(
            in_window <= 4,
            "1s window starting at call {i} saw {in_window} requests"
        );
    }
}

#[tokio::test]
async fn completed_catalog_makes_rerun_a_no_op() {
    let url = "https://example.org/doc/1.pdf";
    let harness = Harness::new(
        2,
        HashMap::from([(url.to_string(), Canned::Pdf(pdf_bytes(9, 2048)))]),
    );
    harness.gateway.seed_documents([(1, url.to_string())]).await;

    let first = harness.dispatcher().run().await.expect("run ok");
    assert_eq!(first.succeeded, 1);

    let second = harness.dispatcher().run().await.expect("rerun ok");
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.processed, 0);
    assert_eq!(harness.transport.call_count().await, 1);
    assert_eq!(harness.gateway.storage_rows().await.len(), 1);
}
