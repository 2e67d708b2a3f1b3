//! In-process bucket store.
//!
//! Implements the same conditional-write contract as the Redis adapter with
//! per-key locking from `DashMap`. Used by tests and by anything that wants
//! the engine without a server; it is not shared between processes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{BucketStore, FieldMap, StoreError, WriteOutcome, ABSENT_VERSION, VERSION_FIELD};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct StoredHash {
    fields: FieldMap,
    expires_at_ms: Option<i64>,
}

impl StoredHash {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn version(&self) -> &str {
        self.fields
            .get(VERSION_FIELD)
            .map(String::as_str)
            .unwrap_or(ABSENT_VERSION)
    }
}

/// A `DashMap`-backed bucket store with clock-driven expiry.
pub struct InMemoryBucketStore {
    entries: DashMap<String, StoredHash>,
    clock: Arc<dyn Clock>,
    /// Number of upcoming conditional writes to reject as conflicts.
    injected_conflicts: AtomicU32,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

impl InMemoryBucketStore {
    /// Create a store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires keys according to `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            injected_conflicts: AtomicU32::new(0),
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    /// Make the next `count` conditional writes report a conflict without
    /// touching the data, as if another writer had won each race.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Write fields directly, bypassing the version check.
    pub fn insert_raw(&self, key: &str, fields: FieldMap, ttl_secs: Option<u64>) {
        let expires_at_ms = ttl_secs.map(|ttl| self.clock.now_ms() + ttl as i64 * 1000);
        self.entries.insert(
            key.to_string(),
            StoredHash {
                fields,
                expires_at_ms,
            },
        );
    }

    /// Remaining time to live of `key` in whole milliseconds, if it has one.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at_ms)
            .map(|at| at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of conditional writes that committed.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of conditional writes rejected as conflicts.
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn conflict(&self) -> WriteOutcome {
        self.conflicts.fetch_add(1, Ordering::SeqCst);
        WriteOutcome::Conflict
    }
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBucketStore")
            .field("keys", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn read_all_fields(&self, key: &str) -> Result<Option<FieldMap>, StoreError> {
        let now = self.clock.now_ms();
        let snapshot = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.fields.clone()),
            Some(_) => None,
            None => None,
        };
        if snapshot.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }

        // Let other tasks run between the read and the caller's write, the
        // way a network round trip would.
        tokio::task::yield_now().await;
        Ok(snapshot)
    }

    async fn conditional_write(
        &self,
        key: &str,
        fields: &[(String, String)],
        expected_version: &str,
        ttl_secs: u64,
    ) -> Result<WriteOutcome, StoreError> {
        if self.take_injected_conflict() {
            trace!(key = %key, "Injected write conflict");
            return Ok(self.conflict());
        }

        let now = self.clock.now_ms();
        let expires_at_ms = Some(now + ttl_secs as i64 * 1000);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = !occupied.get().is_expired(now);
                let current = if live {
                    occupied.get().version()
                } else {
                    ABSENT_VERSION
                };
                if current != expected_version {
                    return Ok(self.conflict());
                }

                let stored = occupied.get_mut();
                if !live {
                    stored.fields.clear();
                }
                for (name, value) in fields {
                    stored.fields.insert(name.clone(), value.clone());
                }
                stored.expires_at_ms = expires_at_ms;
            }
            Entry::Vacant(vacant) => {
                if expected_version != ABSENT_VERSION {
                    return Ok(self.conflict());
                }
                vacant.insert(StoredHash {
                    fields: fields.iter().cloned().collect(),
                    expires_at_ms,
                });
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Committed)
    }

    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at_ms = Some(now + ttl_secs as i64 * 1000);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn fields(version: &str, count: &str) -> Vec<(String, String)> {
        vec![
            ("count".to_string(), count.to_string()),
            (VERSION_FIELD.to_string(), version.to_string()),
        ]
    }

    fn store_with_clock() -> (InMemoryBucketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (InMemoryBucketStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_missing_key_reads_as_none() {
        let store = InMemoryBucketStore::new();
        assert!(store.read_all_fields("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_write_expects_absent_version() {
        let (store, _) = store_with_clock();

        let outcome = store
            .conditional_write("k", &fields("v1", "3"), "v0", 10)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);

        let outcome = store
            .conditional_write("k", &fields("v1", "3"), ABSENT_VERSION, 10)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Committed);

        let stored = store.read_all_fields("k").await.unwrap().unwrap();
        assert_eq!(stored.get("count").map(String::as_str), Some("3"));
        assert_eq!(stored.get(VERSION_FIELD).map(String::as_str), Some("v1"));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (store, _) = store_with_clock();
        store
            .conditional_write("k", &fields("v1", "3"), ABSENT_VERSION, 10)
            .await
            .unwrap();
        store
            .conditional_write("k", &fields("v2", "2"), "v1", 10)
            .await
            .unwrap();

        // A writer still holding v1 loses.
        let outcome = store
            .conditional_write("k", &fields("v3", "1"), "v1", 10)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert_eq!(store.commit_count(), 2);
        assert_eq!(store.conflict_count(), 1);

        let stored = store.read_all_fields("k").await.unwrap().unwrap();
        assert_eq!(stored.get("count").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_keys_expire_with_the_clock() {
        let (store, clock) = store_with_clock();
        store
            .conditional_write("k", &fields("v1", "3"), ABSENT_VERSION, 5)
            .await
            .unwrap();
        assert_eq!(store.ttl_ms("k"), Some(5_000));

        clock.advance(Duration::from_secs(5));
        assert!(store.read_all_fields("k").await.unwrap().is_none());
        assert!(store.is_empty());

        // Expired keys behave as absent for the version check too.
        let outcome = store
            .conditional_write("k", &fields("v2", "1"), ABSENT_VERSION, 5)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Committed);
    }

    #[tokio::test]
    async fn test_set_expiry_and_delete() {
        let (store, clock) = store_with_clock();
        store
            .conditional_write("k", &fields("v1", "3"), ABSENT_VERSION, 100)
            .await
            .unwrap();

        store.set_expiry("k", 2).await.unwrap();
        assert_eq!(store.ttl_ms("k"), Some(2_000));
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.len(), 1);

        store.delete("k").await.unwrap();
        assert!(store.read_all_fields("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_conflicts_leave_data_alone() {
        let (store, _) = store_with_clock();
        store.inject_conflicts(2);

        for _ in 0..2 {
            let outcome = store
                .conditional_write("k", &fields("v1", "3"), ABSENT_VERSION, 10)
                .await
                .unwrap();
            assert_eq!(outcome, WriteOutcome::Conflict);
        }
        assert!(store.read_all_fields("k").await.unwrap().is_none());

        let outcome = store
            .conditional_write("k", &fields("v1", "3"), ABSENT_VERSION, 10)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Committed);
    }
}
