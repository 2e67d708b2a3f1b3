//! Bucket store adapters.
//!
//! A bucket store is any key-value store that can read every field of a
//! hash, apply a field update conditioned on a `version` field, expire keys
//! and delete them. The token bucket engine relies on the conditional write
//! being atomic with respect to the version comparison: either the whole
//! update commits against the version that was checked, or nothing does.

mod memory;
mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryBucketStore;
pub use self::redis::RedisBucketStore;

/// Name of the hash field holding the optimistic-concurrency token.
pub const VERSION_FIELD: &str = "version";

/// Version a missing record is treated as having.
pub const ABSENT_VERSION: &str = "0";

/// All fields of a stored hash.
pub type FieldMap = HashMap<String, String>;

/// Errors that can occur talking to a bucket store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The version matched and the update was applied.
    Committed,
    /// Someone else wrote the record since it was read.
    Conflict,
}

/// A remote key-value store holding bucket records.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Read every field of `key`. Returns `None` when the key does not exist.
    async fn read_all_fields(&self, key: &str) -> Result<Option<FieldMap>, StoreError>;

    /// Write `fields` and set a `ttl_secs` expiry on `key`, but only if the
    /// stored version still equals `expected_version`. A missing key matches
    /// [`ABSENT_VERSION`].
    async fn conditional_write(
        &self,
        key: &str,
        fields: &[(String, String)],
        expected_version: &str,
        ttl_secs: u64,
    ) -> Result<WriteOutcome, StoreError>;

    /// Set the expiry of `key` unconditionally.
    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Remove `key` entirely.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
