//! Redis-backed bucket store.
//!
//! Conditional writes use `WATCH` + `MULTI`/`EXEC`: the version field is
//! re-read under a watch, and the field update plus `EXPIRE` are queued in a
//! single transaction. If another client touches the key between `WATCH` and
//! `EXEC`, Redis aborts the transaction and `EXEC` returns nil, which is
//! reported as a conflict.
//!
//! A key holding something other than a hash (left behind by another
//! application, say) reads as a malformed bucket and is replaced by the
//! next conditional write, which deletes it inside the same transaction.
//!
//! `WATCH` state belongs to a connection, so this adapter keeps a small pool
//! of dedicated connections instead of a multiplexed one.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::Connection;
use redis::{AsyncCommands, Client, RedisResult};
use tracing::{debug, trace, warn};

use super::{BucketStore, FieldMap, StoreError, WriteOutcome, ABSENT_VERSION, VERSION_FIELD};
use crate::config::StoreConfig;
use crate::error::{Result, TollgateError};

/// Reply code for a command run against a key of the wrong type.
const WRONGTYPE: &str = "WRONGTYPE";

/// Redis bucket store with a pool of dedicated connections.
pub struct RedisBucketStore {
    client: Client,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    timeout: Duration,
}

impl RedisBucketStore {
    /// Create a store from configuration. No connection is opened until the
    /// first operation.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.url.as_str())
            .map_err(|e| TollgateError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            max_idle: config.max_idle_connections,
            timeout: config.timeout(),
        })
    }

    /// Open a connection and issue a `PING`.
    pub async fn ping(&self) -> std::result::Result<(), StoreError> {
        let mut con = self.checkout().await?;
        let result = self
            .timed(async { redis::cmd("PING").query_async::<_, String>(&mut con).await })
            .await;
        self.finish(con, result.map(|_| ()))
    }

    async fn checkout(&self) -> std::result::Result<Connection, StoreError> {
        if let Some(con) = self.idle.lock().pop() {
            return Ok(con);
        }
        debug!(max_idle = self.max_idle, "Opening new Redis connection");
        self.timed(self.client.get_async_connection()).await
    }

    /// Return a connection to the pool if the operation left it usable.
    fn finish<T>(
        &self,
        con: Connection,
        result: std::result::Result<T, StoreError>,
    ) -> std::result::Result<T, StoreError> {
        if result.is_ok() {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(con);
            }
        }
        result
    }

    async fn timed<T, F>(&self, fut: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("max_idle", &self.max_idle)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn read_all_fields(&self, key: &str) -> std::result::Result<Option<FieldMap>, StoreError> {
        let mut con = self.checkout().await?;
        let result = self
            .timed(async {
                match con.hgetall::<_, FieldMap>(key).await {
                    // HGETALL answers an empty hash for a missing key.
                    Ok(fields) if fields.is_empty() => Ok(None),
                    Ok(fields) => Ok(Some(fields)),
                    Err(e) if e.code() == Some(WRONGTYPE) => {
                        warn!(key = %key, "Bucket key holds a non-hash value");
                        // Decodes as a malformed record with the absent version.
                        Ok(Some(FieldMap::new()))
                    }
                    Err(e) => Err(e),
                }
            })
            .await;
        self.finish(con, result)
    }

    async fn conditional_write(
        &self,
        key: &str,
        fields: &[(String, String)],
        expected_version: &str,
        ttl_secs: u64,
    ) -> std::result::Result<WriteOutcome, StoreError> {
        let mut con = self.checkout().await?;
        let result = self
            .timed(async {
                redis::cmd("WATCH")
                    .arg(key)
                    .query_async::<_, ()>(&mut con)
                    .await?;

                let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut con).await?;
                let foreign = kind != "hash" && kind != "none";
                let current: Option<String> = if kind == "hash" {
                    con.hget(key, VERSION_FIELD).await?
                } else {
                    None
                };
                let current = current.as_deref().unwrap_or(ABSENT_VERSION);
                if current != expected_version {
                    trace!(key = %key, current = %current, expected = %expected_version, "Version moved before write");
                    redis::cmd("UNWATCH").query_async::<_, ()>(&mut con).await?;
                    return Ok(WriteOutcome::Conflict);
                }

                let mut pipe = redis::pipe();
                pipe.atomic();
                if foreign {
                    debug!(key = %key, kind = %kind, "Replacing non-hash value at bucket key");
                    pipe.del(key).ignore();
                }
                pipe.hset_multiple(key, fields)
                    .ignore()
                    .expire(key, ttl_secs as i64)
                    .ignore();
                let committed: Option<()> = pipe.query_async(&mut con).await?;

                Ok::<_, redis::RedisError>(match committed {
                    Some(()) => WriteOutcome::Committed,
                    None => WriteOutcome::Conflict,
                })
            })
            .await;
        self.finish(con, result)
    }

    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> std::result::Result<(), StoreError> {
        let mut con = self.checkout().await?;
        let result = self
            .timed(async { con.expire::<_, ()>(key, ttl_secs as i64).await })
            .await;
        self.finish(con, result)
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
        let mut con = self.checkout().await?;
        let result = self.timed(async { con.del::<_, ()>(key).await }).await;
        self.finish(con, result)
    }
}
