//! The dispatcher: turns catalog rows into completed outcomes.
//!
//! One feeder streams pending batches from the catalog, classifies each
//! URL, and pushes work items into a bounded channel; `W` workers drain it
//! concurrently; one collector task applies every completion to the
//! counters and is the only writer of the checkpoint file; one reporter
//! prints throughput and ETA to stdout. A single root cancellation token
//! (SIGINT/SIGTERM) stops feeding, closes the channel, and drains workers
//! within the shutdown grace period.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use lexcrawl_model::DocumentId;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ArtifactStore;
use crate::catalog::CatalogGateway;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classify::{UrlClassifier, Verdict, VerdictCounts};
use crate::config::CollectorConfig;
use crate::error::{CollectError, Result};
use crate::events::{CollectEvent, CollectEventBus};
use crate::fetch::{FetchOutcome, FetchWorker, TransportFactory, WorkItem};
use crate::governor::{EgressSelector, RateGovernor};

/// Everything the dispatcher coordinates, grouped so construction stays
/// readable.
#[derive(Clone)]
pub struct CollectorServices {
    pub gateway: Arc<dyn CatalogGateway>,
    pub classifier: Arc<UrlClassifier>,
    pub governor: Arc<RateGovernor>,
    pub selector: Arc<dyn EgressSelector>,
    pub transports: Arc<dyn TransportFactory>,
    pub store: ArtifactStore,
    pub checkpoints: CheckpointStore,
    pub events: Arc<CollectEventBus>,
}

impl std::fmt::Debug for CollectorServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorServices")
            .field("store", &self.store)
            .field("checkpoints", &self.checkpoints)
            .finish()
    }
}

/// Live run counters shared between the collector task and the reporter.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub duplicate: AtomicU64,
    failure_reasons: std::sync::Mutex<HashMap<&'static str, u64>>,
}

impl RunCounters {
    fn note_failure(&self, label: &'static str) {
        let mut reasons = self
            .failure_reasons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *reasons.entry(label).or_insert(0) += 1;
    }

    fn top_failures(&self, limit: usize) -> Vec<(String, u64)> {
        let reasons = self
            .failure_reasons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, u64)> = reasons
            .iter()
            .map(|(label, count)| (label.to_string(), *count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }
}

/// End-of-run report surfaced to the process layer.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duplicate: u64,
    pub elapsed: Duration,
    pub docs_per_hour: f64,
    pub interrupted: bool,
    pub top_failures: Vec<(String, u64)>,
    pub verdicts: VerdictCounts,
    pub checkpoint_path: PathBuf,
}

struct Completion {
    document_id: DocumentId,
    correlation_id: Uuid,
    outcome: FetchOutcome,
}

pub struct Dispatcher {
    config: CollectorConfig,
    services: CollectorServices,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.config.run.workers)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: CollectorConfig,
        services: CollectorServices,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            services,
            shutdown,
        }
    }

    /// Drive the catalog to completion (or cancellation) and return the
    /// run summary. Fatal errors only: per-document failures are counted,
    /// never propagated.
    pub async fn run(&self) -> Result<RunSummary> {
        let started = tokio::time::Instant::now();
        self.services.store.ensure_layout().await?;

        let mut checkpoint = self.load_checkpoint().await?;
        let pending = self.services.gateway.count_pending().await?;
        let budget = self
            .config
            .run
            .max_documents
            .map(|limit| limit.min(pending))
            .unwrap_or(pending);
        // Failed documents are still pending and already counted inside
        // `budget`; carry forward only prior outcomes that left the
        // pending pool.
        checkpoint.total = checkpoint.succeeded
            + checkpoint.duplicate
            + checkpoint.skipped
            + budget;
        let total = checkpoint.total;

        tracing::info!(
            target: "collect::dispatch",
            pending,
            budget,
            workers = self.config.run.workers,
            "collection run starting"
        );

        let workers = self.config.run.workers;
        let (task_tx, task_rx) = mpsc::channel::<WorkItem>(workers);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (done_tx, done_rx) = mpsc::channel::<Completion>(workers * 2);

        let counters = Arc::new(RunCounters::default());
        let last_observed = Arc::new(AtomicI64::new(
            checkpoint.last_document_id,
        ));

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let egress = self.services.selector.select();
            let worker = FetchWorker::new(
                Arc::clone(&self.services.gateway),
                Arc::clone(&self.services.governor),
                egress,
                self.services.transports.direct()?,
                self.services.transports.rendered(),
                self.services.store.clone(),
                crate::gates::QualityGates::new(&self.config.gates),
                self.config.retry,
                self.shutdown.clone(),
            );
            pool.spawn(worker_loop(
                worker_id,
                worker,
                Arc::clone(&task_rx),
                done_tx.clone(),
            ));
        }

        let collector = tokio::spawn(collector_loop(
            done_rx,
            checkpoint,
            self.services.checkpoints.clone(),
            Arc::clone(&counters),
            Arc::clone(&self.services.events),
            self.config.run.checkpoint_interval,
            Arc::clone(&last_observed),
        ));

        let reporter = tokio::spawn(reporter_loop(
            Arc::clone(&counters),
            total,
            self.config.run.report_interval(),
            started,
        ));

        let feed_result = self
            .feed(&task_tx, &done_tx, budget, &last_observed)
            .await;
        drop(task_tx);
        drop(done_tx);

        let forced = self.drain_workers(&mut pool).await;
        let mut checkpoint = collector
            .await
            .map_err(|err| CollectError::Internal(err.to_string()))?;
        reporter.abort();

        // Whatever happened, leave a coherent final checkpoint behind.
        checkpoint.last_document_id = last_observed.load(Ordering::Relaxed);
        checkpoint.updated_at = Utc::now();
        self.services.checkpoints.write(&checkpoint).await?;

        feed_result?;

        let interrupted = self.shutdown.is_cancelled();
        if forced {
            tracing::warn!(
                target: "collect::dispatch",
                grace_secs = self.config.run.shutdown_grace_secs,
                "workers aborted after shutdown grace expired"
            );
        }

        let elapsed = started.elapsed();
        let processed = counters.processed.load(Ordering::Relaxed);
        let docs_per_hour = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64() * 3600.0
        } else {
            0.0
        };

        Ok(RunSummary {
            total,
            processed,
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            duplicate: counters.duplicate.load(Ordering::Relaxed),
            elapsed,
            docs_per_hour,
            interrupted,
            top_failures: counters.top_failures(5),
            verdicts: self.services.classifier.counts(),
            checkpoint_path: self.services.checkpoints.path().clone(),
        })
    }

    async fn load_checkpoint(&self) -> Result<Checkpoint> {
        if !self.config.checkpoint.resume {
            return Ok(Checkpoint::start(0));
        }
        match self.services.checkpoints.load().await? {
            Some(previous) => {
                tracing::info!(
                    target: "collect::dispatch",
                    processed = previous.processed,
                    "resuming from checkpoint"
                );
                Ok(previous)
            }
            None => Ok(Checkpoint::start(0)),
        }
    }

    /// Stream batches from the catalog into the task channel, classifying
    /// as we go. Unfetchable URLs never become worker tasks; they are
    /// reported straight to the collector.
    async fn feed(
        &self,
        task_tx: &mpsc::Sender<WorkItem>,
        done_tx: &mpsc::Sender<Completion>,
        budget: u64,
        last_observed: &AtomicI64,
    ) -> Result<()> {
        let mut after = DocumentId::new(0);
        let mut handled: u64 = 0;
        let mut next_space_check = tokio::time::Instant::now();

        'feeding: while handled < budget {
            if self.shutdown.is_cancelled() {
                break;
            }
            if tokio::time::Instant::now() >= next_space_check {
                if !self.wait_for_free_space().await {
                    break;
                }
                next_space_check = tokio::time::Instant::now()
                    + self.config.cache.free_space_check_interval();
            }

            let batch_limit = (budget - handled)
                .min(self.config.run.batch_size as u64)
                as u32;
            let batch = self
                .services
                .gateway
                .fetch_pending_batch(after, batch_limit)
                .await?;
            if batch.is_empty() {
                break;
            }

            for pending in batch {
                if self.shutdown.is_cancelled() {
                    break 'feeding;
                }
                after = after.max(pending.document_id);
                last_observed.fetch_max(
                    pending.document_id.as_i64(),
                    Ordering::Relaxed,
                );

                let classification =
                    self.services.classifier.classify(&pending.source_url);
                if classification.verdict == Verdict::Unfetchable {
                    tracing::debug!(
                        target: "collect::dispatch",
                        document_id = %pending.document_id,
                        url = %pending.source_url,
                        "skipping unfetchable url"
                    );
                    self.services.events.publish(
                        CollectEvent::DocumentSkipped {
                            document_id: pending.document_id,
                            verdict: classification.verdict,
                        },
                    );
                    let _ = done_tx
                        .send(Completion {
                            document_id: pending.document_id,
                            correlation_id: Uuid::now_v7(),
                            outcome: FetchOutcome::Skipped,
                        })
                        .await;
                    handled += 1;
                    continue;
                }

                let item = WorkItem {
                    document_id: pending.document_id,
                    source_url: pending.source_url,
                    verdict: classification.verdict,
                    confident: classification.confident,
                    correlation_id: Uuid::now_v7(),
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'feeding,
                    sent = task_tx.send(item) => {
                        if sent.is_err() {
                            return Err(CollectError::Internal(
                                "worker pool stopped accepting tasks".into(),
                            ));
                        }
                    }
                }
                handled += 1;
            }
        }
        Ok(())
    }

    /// Block while the cache filesystem is below the free-space floor.
    /// Returns false when cancelled mid-pause.
    async fn wait_for_free_space(&self) -> bool {
        loop {
            let free = match self.services.store.available_space() {
                Some(free) => free,
                None => return true,
            };
            if free >= self.config.cache.min_free_bytes {
                return true;
            }
            tracing::warn!(
                target: "collect::dispatch",
                free_bytes = free,
                min_free_bytes = self.config.cache.min_free_bytes,
                "low disk space; pausing enqueue"
            );
            self.services.events.publish(CollectEvent::RunPaused {
                free_bytes: free,
                min_free_bytes: self.config.cache.min_free_bytes,
            });
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(
                    self.config.cache.free_space_check_interval(),
                ) => {}
            }
        }
    }

    /// Wait for workers; after a cancel signal, bound the wait by the
    /// shutdown grace period and abort stragglers. Returns true when
    /// workers had to be aborted.
    async fn drain_workers(&self, pool: &mut JoinSet<()>) -> bool {
        loop {
            tokio::select! {
                joined = pool.join_next() => match joined {
                    Some(Ok(())) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(
                            target: "collect::dispatch",
                            error = %err,
                            "worker task ended abnormally"
                        );
                        continue;
                    }
                    None => return false,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        let deadline =
            tokio::time::sleep(self.config.run.shutdown_grace());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = pool.join_next() => match joined {
                    Some(_) => continue,
                    None => return false,
                },
                _ = &mut deadline => {
                    pool.abort_all();
                    while pool.join_next().await.is_some() {}
                    return true;
                }
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    worker: FetchWorker,
    task_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    done_tx: mpsc::Sender<Completion>,
) {
    loop {
        let item = {
            let mut guard = task_rx.lock().await;
            guard.recv().await
        };
        let Some(item) = item else { break };

        match worker.process(&item).await {
            Ok(outcome) => {
                if done_tx
                    .send(Completion {
                        document_id: item.document_id,
                        correlation_id: item.correlation_id,
                        outcome,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(
                    target: "collect::dispatch",
                    worker_id,
                    "worker exiting on cancellation"
                );
                break;
            }
            Err(err) => {
                tracing::error!(
                    target: "collect::dispatch",
                    worker_id,
                    document_id = %item.document_id,
                    error = %err,
                    "unexpected worker error"
                );
            }
        }
    }
}

/// Applies completions to counters and the checkpoint. Single writer of
/// the checkpoint file; workers only send messages.
async fn collector_loop(
    mut done_rx: mpsc::Receiver<Completion>,
    mut checkpoint: Checkpoint,
    store: CheckpointStore,
    counters: Arc<RunCounters>,
    events: Arc<CollectEventBus>,
    checkpoint_interval: u64,
    last_observed: Arc<AtomicI64>,
) -> Checkpoint {
    let mut since_write: u64 = 0;

    while let Some(completion) = done_rx.recv().await {
        match &completion.outcome {
            FetchOutcome::Success { metadata, version } => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                checkpoint.processed += 1;
                checkpoint.succeeded += 1;
                events.publish(CollectEvent::DocumentSucceeded {
                    document_id: completion.document_id,
                    correlation_id: completion.correlation_id,
                    byte_size: metadata.byte_size,
                    version: *version,
                });
            }
            FetchOutcome::Duplicate => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                counters.duplicate.fetch_add(1, Ordering::Relaxed);
                checkpoint.processed += 1;
                checkpoint.duplicate += 1;
                events.publish(CollectEvent::DocumentDuplicate {
                    document_id: completion.document_id,
                    correlation_id: completion.correlation_id,
                });
            }
            FetchOutcome::Skipped => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                checkpoint.skipped += 1;
            }
            FetchOutcome::Failed { reason, attempts } => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                counters.note_failure(reason.label());
                checkpoint.processed += 1;
                checkpoint.failed += 1;
                events.publish(CollectEvent::DocumentFailed {
                    document_id: completion.document_id,
                    correlation_id: completion.correlation_id,
                    reason: reason.clone(),
                    attempts: *attempts,
                });
            }
        }

        since_write += 1;
        if since_write >= checkpoint_interval {
            checkpoint.last_document_id =
                last_observed.load(Ordering::Relaxed);
            checkpoint.updated_at = Utc::now();
            match store.write(&checkpoint).await {
                Ok(()) => {
                    events.publish(CollectEvent::CheckpointWritten {
                        processed: checkpoint.processed,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        target: "collect::checkpoint",
                        error = %err,
                        "periodic checkpoint write failed"
                    );
                }
            }
            since_write = 0;
        }
    }

    checkpoint
}

/// Progress line on stdout plus a structured log record, on an interval.
async fn reporter_loop(
    counters: Arc<RunCounters>,
    total: u64,
    interval: Duration,
    started: tokio::time::Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Delay,
    );
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let processed = counters.processed.load(Ordering::Relaxed);
        let skipped = counters.skipped.load(Ordering::Relaxed);
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };
        let handled = processed + skipped;
        let eta_secs = if rate > 0.0 && total > handled {
            (total - handled) as f64 / rate
        } else {
            0.0
        };

        println!(
            "progress: {handled}/{total} (ok {succeeded}, dup {duplicate}, fail {failed}, skip {skipped}) {rate:.2} docs/s eta {eta_secs:.0}s",
            succeeded = counters.succeeded.load(Ordering::Relaxed),
            duplicate = counters.duplicate.load(Ordering::Relaxed),
            failed = counters.failed.load(Ordering::Relaxed),
        );
        tracing::info!(
            target: "collect::progress",
            handled,
            total,
            rate,
            eta_secs,
            "progress"
        );
    }
}
