//! Pre-configured limiter construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::engine::RetryPolicy;
use super::limiter::{RateLimiter, RateLimiterConfig};
use super::rules::LimiterRule;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::BucketStore;

/// Builds limiters that share one store, clock and retry policy.
pub struct LimiterFactory<S: BucketStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S: BucketStore> Clone for LimiterFactory<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<S: BucketStore> LimiterFactory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Configuration for `max_requests` per `window`, namespaced
    /// `<kind>:<name>`. One token comes back every `window / max_requests`.
    pub fn window_config(
        kind: &str,
        name: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<RateLimiterConfig> {
        if max_requests == 0 {
            return Err(TollgateError::Config(format!(
                "{}:{} must allow at least one request",
                kind, name
            )));
        }
        if window.is_zero() {
            return Err(TollgateError::Config(format!(
                "{}:{} needs a non-zero window",
                kind, name
            )));
        }

        let refill_interval_secs = window.as_secs_f64() / max_requests as f64;
        Ok(RateLimiterConfig::new(max_requests, refill_interval_secs)?
            .with_namespace(format!("{}:{}", kind, name)))
    }

    /// Limit for one route, namespaced `api:<route>`.
    pub fn per_route(&self, route: &str, max_requests: u64, window: Duration) -> Result<RateLimiter<S>> {
        let config = Self::window_config("api", route, max_requests, window)?;
        Ok(self.create(config))
    }

    /// Limit for one user action, namespaced `user:<action>`.
    pub fn per_user_action(
        &self,
        action: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<RateLimiter<S>> {
        let config = Self::window_config("user", action, max_requests, window)?;
        Ok(self.create(config))
    }

    /// Limiter for an arbitrary configuration.
    pub fn create(&self, config: RateLimiterConfig) -> RateLimiter<S> {
        debug!(
            namespace = %config.namespace(),
            max = config.max(),
            refill_interval = ?config.refill_interval(),
            "Creating rate limiter"
        );
        RateLimiter::with_parts(
            self.store.clone(),
            self.clock.clone(),
            config,
            self.retry.clone(),
        )
    }

    /// Limiter for a declarative rule.
    pub fn from_rule(&self, rule: &LimiterRule) -> Result<RateLimiter<S>> {
        match rule {
            LimiterRule::Route { name, requests, per } => {
                self.per_route(name, *requests, per.duration())
            }
            LimiterRule::UserAction { name, requests, per } => {
                self.per_user_action(name, *requests, per.duration())
            }
            LimiterRule::Custom {
                namespace,
                max,
                refill_interval_secs,
            } => Ok(self.create(
                RateLimiterConfig::new(*max, *refill_interval_secs)?.with_namespace(namespace.as_str()),
            )),
        }
    }

    /// Build every rule, keyed by namespace. Two rules may not share a
    /// namespace.
    pub fn build_all(&self, rules: &[LimiterRule]) -> Result<HashMap<String, RateLimiter<S>>> {
        let mut limiters = HashMap::with_capacity(rules.len());
        for rule in rules {
            let limiter = self.from_rule(rule)?;
            let namespace = limiter.config().namespace().to_string();
            if limiters.contains_key(&namespace) {
                return Err(TollgateError::Config(format!(
                    "duplicate limiter namespace {:?}",
                    namespace
                )));
            }
            limiters.insert(namespace, limiter);
        }
        Ok(limiters)
    }
}

impl<S: BucketStore> std::fmt::Debug for LimiterFactory<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterFactory")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
