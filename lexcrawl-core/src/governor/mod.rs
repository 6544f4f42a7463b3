//! Outbound request-rate enforcement.
//!
//! Two ceilings apply at HTTP request time: a per-egress-identity token
//! bucket and a global process-wide bucket. A worker about to issue a
//! request takes one token from each, in that order, blocking cooperatively
//! up to the configured timeout. Cancellation propagates through a blocked
//! acquisition and returns promptly.
//!
//! The target domain tolerates ~2-3 req/s per source IP before its failure
//! cliff, hence the 2.0 req/s per-egress default and the expectation that
//! effective worker count scales with the number of egress identities.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateConfig;
use crate::error::{CollectError, Result};

/// A distinct outbound IP or proxy identity; the unit of rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EgressId(Arc<str>);

impl EgressId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EgressId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Picks the egress identity for the next worker. Opaque to the core;
/// proxy-aware deployments supply their own implementation.
pub trait EgressSelector: Send + Sync + std::fmt::Debug {
    fn select(&self) -> EgressId;
    fn identities(&self) -> Vec<EgressId>;
}

/// Default selector: cycle through the configured identities.
#[derive(Debug)]
pub struct RoundRobinSelector {
    identities: Vec<EgressId>,
    next: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(identities: Vec<EgressId>) -> Self {
        debug_assert!(!identities.is_empty());
        Self {
            identities,
            next: AtomicUsize::new(0),
        }
    }
}

impl EgressSelector for RoundRobinSelector {
    fn select(&self) -> EgressId {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.identities[idx % self.identities.len()].clone()
    }

    fn identities(&self) -> Vec<EgressId> {
        self.identities.clone()
    }
}

// Penalty debits may push a bucket negative; cap the debt so a burst of
// 429s cannot stall an egress longer than this.
const MAX_DEBT_SECS: f64 = 30.0;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one full token accrues at the current fill level.
    fn eta_for_one(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.rate)
    }

    fn debit(&mut self, tokens: f64) {
        let floor = -(self.rate * MAX_DEBT_SECS);
        self.tokens = (self.tokens - tokens).max(floor);
    }
}

/// Process-wide rate enforcement over all outbound HTTP requests.
pub struct RateGovernor {
    egress: HashMap<EgressId, Mutex<TokenBucket>>,
    global: Mutex<TokenBucket>,
    acquire_timeout: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("egress_identities", &self.egress.len())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl RateGovernor {
    pub fn new(
        rate: &RateConfig,
        workers: usize,
        identities: &[EgressId],
        shutdown: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        let egress = identities
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Mutex::new(TokenBucket::new(
                        rate.egress_burst,
                        rate.egress_rate,
                        now,
                    )),
                )
            })
            .collect();
        let global = Mutex::new(TokenBucket::new(
            rate.effective_global_burst(workers),
            rate.effective_global_rate(workers),
            now,
        ));
        Self {
            egress,
            global,
            acquire_timeout: rate.acquire_timeout(),
            shutdown,
        }
    }

    /// Take one token from the egress bucket, then one from the global
    /// bucket. Blocks up to the configured timeout; a timed-out document
    /// becomes a retryable failure at the caller.
    pub async fn acquire(&self, egress: &EgressId) -> Result<()> {
        let deadline = Instant::now() + self.acquire_timeout;
        let bucket = self.egress.get(egress).ok_or_else(|| {
            CollectError::Internal(format!(
                "unknown egress identity: {egress}"
            ))
        })?;
        self.take_one(bucket, deadline).await?;
        self.take_one(&self.global, deadline).await
    }

    /// Debit tokens from an egress bucket, throttling every worker bound to
    /// that identity. Used on HTTP 429.
    pub async fn penalize(&self, egress: &EgressId, tokens: f64) {
        if let Some(bucket) = self.egress.get(egress) {
            let mut guard = bucket.lock().await;
            let now = Instant::now();
            guard.refill(now);
            guard.debit(tokens);
            tracing::debug!(
                target: "collect::governor",
                egress = %egress,
                debit = tokens,
                balance = guard.tokens,
                "egress bucket penalized"
            );
        }
    }

    async fn take_one(
        &self,
        bucket: &Mutex<TokenBucket>,
        deadline: Instant,
    ) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let wait = {
                let mut guard = bucket.lock().await;
                guard.refill(Instant::now());
                if guard.try_take() {
                    return Ok(());
                }
                guard.eta_for_one()
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(CollectError::RateLimitTimeout(
                    self.acquire_timeout,
                ));
            }
            let sleep_for = wait.min(deadline - now);

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(CollectError::Cancelled);
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}
