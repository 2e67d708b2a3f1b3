//! Token bucket rate limiting over a shared bucket store.

mod bucket;
mod engine;
mod factory;
mod limiter;
mod rules;

pub use bucket::{BucketParams, BucketRecord, COUNT_FIELD, REFILLED_AT_FIELD};
pub use engine::{RetryPolicy, TokenBucketEngine};
pub use factory::LimiterFactory;
pub use limiter::{FailurePolicy, RateLimitResult, RateLimiter, RateLimiterConfig, DEFAULT_NAMESPACE};
pub use rules::{LimiterRule, LimiterRules, TimeUnit};
