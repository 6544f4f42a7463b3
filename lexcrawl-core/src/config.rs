use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CollectError, Result};

/// Global knobs that tune collector behaviour.
///
/// All fields carry defaults so deployments can start from a minimal
/// configuration payload and progressively override sections.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollectorConfig {
    /// Worker pool sizing and batch/checkpoint cadence.
    pub run: RunConfig,
    /// Per-egress and global request-rate ceilings.
    pub rate: RateConfig,
    /// Outbound HTTP client tuning.
    pub http: HttpConfig,
    /// Retry/backoff policy shared by all workers.
    pub retry: RetryConfig,
    /// Quality-gate thresholds applied to every fetched artifact.
    pub gates: GateConfig,
    /// Content-addressed cache location and free-space guard.
    pub cache: CacheConfig,
    /// Checkpoint location and resume behaviour.
    pub checkpoint: CheckpointConfig,
    /// Headless-browser pool for JS-rendered pages.
    pub browser: BrowserConfig,
    /// URL classification rule lists.
    pub classifier: ClassifierConfig,
    /// Egress identities (IP labels or proxy names) workers round-robin over.
    /// A single anonymous identity is assumed when empty.
    pub egress_identities: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Concurrent fetch workers. The per-egress safe upper bound is
    /// `egress_rate` per identity; concurrency beyond that hits the target
    /// domain's failure cliff.
    pub workers: usize,
    /// Documents pulled from the catalog per batch.
    pub batch_size: u32,
    /// Checkpoint written after every this many processed documents.
    pub checkpoint_interval: u64,
    /// Optional hard cap on documents processed this run.
    pub max_documents: Option<u64>,
    /// Progress line cadence (seconds).
    pub report_interval_secs: u64,
    /// How long to wait for in-flight workers after a cancel signal.
    pub shutdown_grace_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 100,
            checkpoint_interval: 100,
            max_documents: None,
            report_interval_secs: 10,
            shutdown_grace_secs: 30,
        }
    }
}

impl RunConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Sustained requests/second allowed per egress identity.
    pub egress_rate: f64,
    /// Token-bucket capacity per egress identity.
    pub egress_burst: f64,
    /// Aggregate requests/second across the whole process.
    /// Defaults to `workers * egress_rate` when unset.
    pub global_rate: Option<f64>,
    /// Global bucket capacity. Defaults to the worker count when unset.
    pub global_burst: Option<f64>,
    /// How long a worker may block waiting for tokens before the document
    /// becomes a retryable failure (milliseconds).
    pub acquire_timeout_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            egress_rate: 2.0,
            egress_burst: 2.0,
            global_rate: None,
            global_burst: None,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl RateConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn effective_global_rate(&self, workers: usize) -> f64 {
        self.global_rate
            .unwrap_or(self.egress_rate * workers as f64)
    }

    pub fn effective_global_burst(&self, workers: usize) -> f64 {
        self.global_burst.unwrap_or(workers.max(1) as f64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Total per-attempt deadline (seconds).
    pub request_timeout_secs: u64,
    /// Per-read deadline while streaming the body (seconds).
    pub read_timeout_secs: u64,
    /// Redirect-following cap.
    pub max_redirects: usize,
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            read_timeout_secs: 10,
            max_redirects: 5,
            user_agent: concat!(
                "lexcrawl/",
                env!("CARGO_PKG_VERSION"),
                " (legal corpus collector)"
            )
            .to_string(),
            accept: "application/pdf,text/html;q=0.9,*/*;q=0.8".to_string(),
            accept_language: "en".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f64,
    /// Extra multiplier applied to the next backoff after an HTTP 429.
    pub penalty_429: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_factor: 2.0,
            jitter_ratio: 0.25,
            penalty_429: 4.0,
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Artifacts smaller than this are rejected as snippets/error pages.
    pub min_bytes: u64,
    /// Artifacts larger than this are rejected outright.
    pub max_bytes: u64,
    /// Responses slower than this fail the HTTP gate (seconds).
    pub max_response_time_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            max_bytes: 100 * 1024 * 1024,
            max_response_time_secs: 120,
        }
    }
}

impl GateConfig {
    pub fn max_response_time(&self) -> Duration {
        Duration::from_secs(self.max_response_time_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the content-addressed artifact store.
    pub root: PathBuf,
    /// The dispatcher pauses enqueueing below this free-space floor.
    pub min_free_bytes: u64,
    pub free_space_check_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifact-cache"),
            min_free_bytes: 1024 * 1024 * 1024,
            free_space_check_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn free_space_check_interval(&self) -> Duration {
        Duration::from_secs(self.free_space_check_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding `progress.json`.
    pub dir: PathBuf,
    /// Load the existing checkpoint on startup instead of starting fresh.
    pub resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            resume: true,
        }
    }
}

impl CheckpointConfig {
    pub fn progress_path(&self) -> PathBuf {
        self.dir.join("progress.json")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub pool_size: usize,
    /// A browser instance is recycled after serving this many requests to
    /// bound its memory growth.
    pub max_requests: u64,
    pub navigation_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            max_requests: 500,
            navigation_timeout_secs: 45,
        }
    }
}

impl BrowserConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

/// Rule lists consumed by the URL classifier, in evaluation order:
/// unfetchable, rendered, direct. Entries are substring matches unless
/// prefixed with `re:` (regex) or `suffix:`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub unfetchable: Vec<String>,
    pub rendered: Vec<String>,
    pub direct: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            unfetchable: vec!["/docfragment/".to_string()],
            rendered: vec![
                "/search/".to_string(),
                "/browse/".to_string(),
                "re:[?&](query|page|form)=".to_string(),
            ],
            direct: vec![
                "suffix:.pdf".to_string(),
                "/doc/".to_string(),
                "/judgment/".to_string(),
                "/download/".to_string(),
            ],
        }
    }
}

impl CollectorConfig {
    /// Reject configurations the run could not safely start with.
    pub fn validate(&self) -> Result<()> {
        if self.run.workers == 0 {
            return Err(CollectError::Config(
                "run.workers must be at least 1".into(),
            ));
        }
        if self.run.batch_size == 0 {
            return Err(CollectError::Config(
                "run.batch_size must be at least 1".into(),
            ));
        }
        if self.rate.egress_rate <= 0.0 {
            return Err(CollectError::Config(
                "rate.egress_rate must be positive".into(),
            ));
        }
        if self.rate.egress_burst < 1.0 {
            return Err(CollectError::Config(
                "rate.egress_burst must be at least 1".into(),
            ));
        }
        if let Some(rate) = self.rate.global_rate {
            if rate <= 0.0 {
                return Err(CollectError::Config(
                    "rate.global_rate must be positive".into(),
                ));
            }
        }
        if self.gates.min_bytes > self.gates.max_bytes {
            return Err(CollectError::Config(
                "gates.min_bytes exceeds gates.max_bytes".into(),
            ));
        }
        if self.cache.root.as_os_str().is_empty() {
            return Err(CollectError::Config(
                "cache.root must not be empty".into(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(CollectError::Config(
                "retry.backoff_factor must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return Err(CollectError::Config(
                "retry.jitter_ratio must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Egress identities with the single-identity fallback applied.
    pub fn egress_pool(&self) -> Vec<String> {
        if self.egress_identities.is_empty() {
            vec!["default".to_string()]
        } else {
            self.egress_identities.clone()
        }
    }
}
