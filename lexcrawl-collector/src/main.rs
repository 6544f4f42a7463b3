//! # lexcrawl collector
//!
//! Long-running process that drives the collection engine against a
//! catalog of legal documents: rate-limited concurrent fetching, quality
//! gating, content-addressed storage, and crash-safe progress tracking.
//!
//! Exit codes: 0 on completion or a cleanly handled SIGINT/SIGTERM, 2 on a
//! configuration error, 1 on a fatal run error (catalog unreachable, cache
//! root unwritable, read failure after retries).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lexcrawl_core::{
    ArtifactStore, CatalogGateway, CheckpointStore, CollectorConfig,
    CollectorServices, Dispatcher, EgressId, HttpTransportFactory,
    PostgresCatalogGateway, RateGovernor, RoundRobinSelector, RunSummary,
    UrlClassifier,
};

/// Command line arguments for the collector process.
#[derive(Parser, Debug)]
#[command(name = "lexcrawl")]
#[command(about = "Rate-limited concurrent collector for legal document corpora")]
struct Args {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Catalog connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Start from a fresh checkpoint even when one exists.
    #[arg(long)]
    no_resume: bool,

    /// Hard cap on documents processed this run.
    #[arg(long)]
    max_documents: Option<u64>,

    /// Write structured JSON logs to this file in addition to stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| {
                    format!("cannot open log file {}", path.display())
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CollectorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| {
                format!("cannot read config file {}", path.display())
            })?;
            toml::from_str(&raw).with_context(|| {
                format!("invalid config file {}", path.display())
            })?
        }
        None => CollectorConfig::default(),
    };

    if args.no_resume {
        config.checkpoint.resume = false;
    }
    if args.max_documents.is_some() {
        config.run.max_documents = args.max_documents;
    }
    config.validate()?;
    Ok(config)
}

/// Root cancellation: first SIGINT/SIGTERM cancels the token; a second
/// SIGINT exits immediately.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received; draining workers");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; draining workers");
            }
        }
        shutdown.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; exiting immediately");
            std::process::exit(130);
        }
    });
}

async fn build_services(
    config: &CollectorConfig,
    database_url: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<CollectorServices> {
    let classifier = Arc::new(UrlClassifier::from_config(
        &config.classifier,
    )?);

    let gateway = PostgresCatalogGateway::connect(
        database_url,
        config.run.workers,
        classifier.unfetchable_substrings(),
    )
    .await
    .context("catalog unreachable")?;
    lexcrawl_core::MIGRATOR
        .run(gateway.pool())
        .await
        .context("catalog migrations failed")?;
    info!(run_id = %gateway.run_id(), "catalog connected");

    let identities: Vec<EgressId> =
        config.egress_pool().iter().map(EgressId::new).collect();
    let governor = Arc::new(RateGovernor::new(
        &config.rate,
        config.run.workers,
        &identities,
        shutdown.clone(),
    ));

    #[cfg(feature = "browser")]
    let rendered = {
        let pool = Arc::new(lexcrawl_core::fetch::browser::BrowserPool::new(
            config.browser.clone(),
        ));
        Some(Arc::new(lexcrawl_core::fetch::browser::RenderedFetcher::new(
            pool,
        )) as Arc<dyn lexcrawl_core::FetchTransport>)
    };
    #[cfg(not(feature = "browser"))]
    let rendered = None;

    Ok(CollectorServices {
        gateway: Arc::new(gateway) as Arc<dyn CatalogGateway>,
        classifier,
        governor,
        selector: Arc::new(RoundRobinSelector::new(identities)),
        transports: Arc::new(HttpTransportFactory::new(
            config.http.clone(),
            config.gates.max_bytes,
            rendered,
        )),
        store: ArtifactStore::new(config.cache.root.clone()),
        checkpoints: CheckpointStore::new(config.checkpoint.progress_path()),
        events: Arc::new(Default::default()),
    })
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.interrupted {
        "interrupted"
    } else {
        "complete"
    };
    println!(
        "run {status}: {processed}/{total} processed in {elapsed:.0?} \
         ({rate:.0} docs/hour)",
        processed = summary.processed,
        total = summary.total,
        elapsed = summary.elapsed,
        rate = summary.docs_per_hour,
    );
    println!(
        "  succeeded {s}, duplicate {d}, failed {f}, skipped {k}",
        s = summary.succeeded,
        d = summary.duplicate,
        f = summary.failed,
        k = summary.skipped,
    );
    println!(
        "  verdicts: direct {dv}, rendered {rv}, unfetchable {uv} \
         (low confidence {lc})",
        dv = summary.verdicts.direct,
        rv = summary.verdicts.rendered,
        uv = summary.verdicts.unfetchable,
        lc = summary.verdicts.low_confidence,
    );
    if !summary.top_failures.is_empty() {
        println!("  top failure reasons:");
        for (label, count) in &summary.top_failures {
            println!("    {label}: {count}");
        }
    }
    println!(
        "  checkpoint: {}",
        summary.checkpoint_path.display()
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_tracing(args.log_file.as_ref()) {
        eprintln!("logging setup failed: {err:#}");
        return ExitCode::from(2);
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            return ExitCode::from(2);
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let services = match build_services(
        &config,
        &args.database_url,
        &shutdown,
    )
    .await
    {
        Ok(services) => services,
        Err(err) => {
            error!("startup failed: {err:#}");
            return ExitCode::from(1);
        }
    };

    let dispatcher = Dispatcher::new(config, services, shutdown);
    match dispatcher.run().await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("run aborted: {err:#}");
            ExitCode::from(1)
        }
    }
}
