//! Token bucket engine.
//!
//! Each evaluation reads the bucket, applies refill and admission locally,
//! then writes the new state back conditioned on the version it read. If
//! another caller wrote in between, the local result is thrown away and the
//! whole cycle starts again from a fresh read. A losing writer can only find
//! fewer tokens than before, so retrying never over-admits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::bucket::{self, BucketParams, Snapshot};
use super::limiter::RateLimitResult;
use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::store::{BucketStore, WriteOutcome};

/// Longest exponent used when growing the backoff window.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// How the engine reacts to losing a write race.
///
/// The default retries forever without pausing. Setting `max_attempts`
/// surfaces [`TollgateError::Contended`] once that many attempts have lost;
/// a non-zero `backoff_base_ms` sleeps for a random duration in
/// `0..=min(base * 2^(attempt-1), max)` between attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: u64,
    #[serde(default)]
    pub backoff_max_ms: u64,
}

impl RetryPolicy {
    /// Retry until the write lands.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Give up after `max_attempts` lost races.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..Self::default()
        }
    }

    /// Add jittered exponential backoff between attempts.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    fn backoff(&self, attempt: u32) -> Option<Duration> {
        if self.backoff_base_ms == 0 {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let ceiling = self
            .backoff_base_ms
            .saturating_mul(1 << shift)
            .min(self.backoff_max_ms.max(self.backoff_base_ms));
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Some(Duration::from_millis(jittered))
    }
}

/// Drives refill, admission and the optimistic write loop against a store.
pub struct TokenBucketEngine<S: BucketStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    params: BucketParams,
    retry: RetryPolicy,
}

impl<S: BucketStore> TokenBucketEngine<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        params: BucketParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            params,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn params(&self) -> &BucketParams {
        &self.params
    }

    /// Evaluate `cost` against the bucket at `key`.
    ///
    /// With `mutate` the tokens are taken and the new state is written back;
    /// without it the call is a read-only preview.
    pub async fn evaluate(&self, key: &str, cost: f64, mutate: bool) -> Result<RateLimitResult> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(TollgateError::InvalidCost(cost));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let now_ms = self.clock.now_ms();
            let snapshot = Snapshot::from_fields(self.store.read_all_fields(key).await?, now_ms);
            if snapshot.malformed {
                warn!(key = %key, "Malformed bucket record, treating as full");
            }

            let decision = bucket::evaluate(snapshot.record, &self.params, now_ms, cost, mutate);

            trace!(
                key = %key,
                cost = cost,
                mutate = mutate,
                attempt = attempt,
                allowed = decision.allowed,
                count = decision.record.count,
                "Evaluated bucket"
            );

            let result = RateLimitResult {
                allowed: decision.allowed,
                remaining: decision.remaining(),
                limit: self.params.max as u64,
                resets_at: to_datetime(decision.resets_at_ms),
            };

            if !mutate {
                return Ok(result);
            }

            let version = uuid::Uuid::new_v4().to_string();
            let fields = decision.record.encode(&version);
            let ttl = bucket::ttl_secs(decision.resets_at_ms, now_ms);

            match self
                .store
                .conditional_write(key, &fields, &snapshot.version, ttl)
                .await?
            {
                WriteOutcome::Committed => {
                    if !result.allowed {
                        debug!(key = %key, cost = cost, remaining = result.remaining, "Rate limit exceeded");
                    }
                    return Ok(result);
                }
                WriteOutcome::Conflict => {
                    debug!(key = %key, attempt = attempt, "Bucket changed during update, retrying");
                    if self.retry.exhausted(attempt) {
                        warn!(key = %key, attempts = attempt, "Giving up on contended bucket");
                        return Err(TollgateError::Contended {
                            key: key.to_string(),
                            attempts: attempt,
                        });
                    }
                    if let Some(delay) = self.retry.backoff(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl<S: BucketStore> std::fmt::Debug for TokenBucketEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketEngine")
            .field("params", &self.params)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn to_datetime(epoch_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
