//! Rate limiter facade.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::bucket::BucketParams;
use super::engine::{RetryPolicy, TokenBucketEngine};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::BucketStore;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Longest accepted refill interval (one year).
const MAX_INTERVAL_MS: u128 = 365 * 24 * 60 * 60 * 1000;

/// Immutable settings for one limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    max: u64,
    refill_interval: Duration,
    namespace: String,
}

impl RateLimiterConfig {
    /// A bucket of `max` tokens regaining one token every
    /// `refill_interval_secs` seconds, in the default namespace.
    pub fn new(max: u64, refill_interval_secs: f64) -> Result<Self> {
        if max == 0 {
            return Err(TollgateError::Config(
                "bucket capacity must be at least 1".to_string(),
            ));
        }
        let refill_interval = Duration::try_from_secs_f64(refill_interval_secs)
            .ok()
            .filter(|interval| (1..=MAX_INTERVAL_MS).contains(&interval.as_millis()))
            .ok_or_else(|| {
                TollgateError::Config(format!(
                    "refill interval must be between 0.001 and {} seconds, got {}",
                    MAX_INTERVAL_MS / 1000,
                    refill_interval_secs
                ))
            })?;

        Ok(Self {
            max,
            refill_interval,
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    /// Use `namespace` as the key prefix. An empty string keeps the default.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        if !namespace.is_empty() {
            self.namespace = namespace;
        }
        self
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn bucket_params(&self) -> BucketParams {
        BucketParams {
            max: self.max as f64,
            refill_interval_ms: self.refill_interval.as_secs_f64() * 1000.0,
        }
    }
}

/// Outcome of a `consume` or `check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Whole tokens left after the decision.
    pub remaining: u64,
    /// Bucket capacity.
    pub limit: u64,
    /// When the bucket will be full again if nothing else consumes.
    pub resets_at: DateTime<Utc>,
}

impl RateLimitResult {
    /// Time from `now` until the bucket is full again.
    pub fn reset_after(&self, now: DateTime<Utc>) -> Duration {
        (self.resets_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What a caller should do when the store cannot be reached.
///
/// The limiter itself always reports store failures; this policy is for the
/// layer that turns decisions into responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Propagate the failure, which usually means rejecting the request.
    #[default]
    Closed,
    /// Let the request through as if the bucket were full.
    Open,
}

impl FailurePolicy {
    /// Apply the policy to the outcome of a limiter call. Only store
    /// failures are affected.
    pub fn resolve(
        self,
        outcome: Result<RateLimitResult>,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult> {
        match outcome {
            Err(TollgateError::Store(err)) if self == FailurePolicy::Open => {
                warn!(error = %err, "Bucket store unavailable, failing open");
                Ok(RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    limit,
                    resets_at: now,
                })
            }
            other => other,
        }
    }
}

/// A namespaced token bucket limiter over a shared store.
///
/// Holds no mutable state of its own; every bucket lives in the store, so a
/// limiter can be shared freely across tasks and processes.
pub struct RateLimiter<S: BucketStore> {
    config: RateLimiterConfig,
    engine: TokenBucketEngine<S>,
}

impl<S: BucketStore> RateLimiter<S> {
    /// Create a limiter using the system clock and unbounded conflict retry.
    pub fn new(store: Arc<S>, config: RateLimiterConfig) -> Self {
        Self::with_parts(store, Arc::new(SystemClock), config, RetryPolicy::default())
    }

    /// Create a limiter with an explicit clock and retry policy.
    pub fn with_parts(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: RateLimiterConfig,
        retry: RetryPolicy,
    ) -> Self {
        let engine = TokenBucketEngine::new(store, clock, config.bucket_params(), retry);
        Self { config, engine }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Bucket capacity.
    pub fn limit(&self) -> u64 {
        self.config.max
    }

    /// Store key for a caller key: `<namespace>:<key>`.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    /// Take one token for `key`.
    pub async fn consume(&self, key: &str) -> Result<RateLimitResult> {
        self.consume_cost(key, 1.0).await
    }

    /// Take `cost` tokens for `key` if that many are available.
    pub async fn consume_cost(&self, key: &str, cost: f64) -> Result<RateLimitResult> {
        let store_key = self.store_key(key);
        trace!(key = %store_key, cost = cost, "Consuming tokens");
        self.engine.evaluate(&store_key, cost, true).await
    }

    /// Preview whether one token could be taken, without taking it.
    pub async fn check(&self, key: &str) -> Result<RateLimitResult> {
        self.check_cost(key, 1.0).await
    }

    /// Preview whether `cost` tokens could be taken, without taking them.
    pub async fn check_cost(&self, key: &str, cost: f64) -> Result<RateLimitResult> {
        let store_key = self.store_key(key);
        self.engine.evaluate(&store_key, cost, false).await
    }

    /// Forget the bucket for `key`; the next access finds it full.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let store_key = self.store_key(key);
        trace!(key = %store_key, "Resetting bucket");
        self.engine.store().delete(&store_key).await?;
        Ok(())
    }
}

impl<S: BucketStore> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
