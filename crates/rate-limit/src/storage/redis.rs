//! Redis bucket storage.
//!
//! Each bucket is a hash `{prefix}{key}` with the fields `tokens`, `last_refill_ms` and
//! `version`. Reads use `HMGET`; writes go through a Lua script that only applies the
//! update if `version` is unchanged, and refreshes the expiry in the same step.
//!
//! Versions come from a counter `{prefix}{key}:version` that lives twice as long as the
//! hash. A bucket recreated after expiry continues the old numbering, so a reader that
//! loaded the expired bucket cannot swap over the new one.

use std::{sync::LazyLock, time::Duration};

use config::RedisConfig;
use jiff::Timestamp;
use redis::Script;

use super::{
    BucketStorage, StorageError, VersionedBucket,
    redis_pool::{self, Pool},
};
use crate::bucket::Bucket;

static COMPARE_AND_SWAP: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('HGET', KEYS[1], 'version')
        if (current == false and ARGV[1] == '0') or current == ARGV[1] then
            local version = redis.call('INCR', KEYS[2])
            if current and version <= tonumber(current) then
                version = tonumber(current) + 1
                redis.call('SET', KEYS[2], version)
            end
            redis.call('HSET', KEYS[1], 'tokens', ARGV[2], 'last_refill_ms', ARGV[3], 'version', version)
            redis.call('PEXPIRE', KEYS[1], ARGV[4])
            redis.call('PEXPIRE', KEYS[2], ARGV[5])
            return 1
        end
        return 0
        ",
    )
});

/// Redis bucket storage implementation.
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
}

impl RedisStorage {
    /// Create a new Redis storage instance.
    ///
    /// The server is pinged once. If it does not answer, the storage is still created:
    /// requests are handled by the failure mode until Redis comes back.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = redis_pool::create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let storage = Self {
            pool,
            key_prefix: config.key_prefix.clone(),
        };

        match storage.ping().await {
            Ok(()) => log::debug!("Connected to Redis for rate limit storage"),
            Err(e) => log::warn!("Redis is not reachable at startup, rate limits degrade until it is: {e}"),
        }

        Ok(storage)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn version_key(&self, key: &str) -> String {
        format!("{}{key}:version", self.key_prefix)
    }

    async fn connection(&self) -> Result<deadpool::managed::Object<redis_pool::Manager>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))
    }
}

impl BucketStorage for RedisStorage {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>, StorageError> {
        let mut conn = self.connection().await?;

        let (tokens, last_refill_ms, version): (Option<f64>, Option<i64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.full_key(key))
            .arg("tokens")
            .arg("last_refill_ms")
            .arg("version")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let Some(version) = version else {
            return Ok(None);
        };

        // A hash with a version but unreadable fields was not written by us. Keep the
        // version so the next write replaces it, and let evaluation clamp the rest.
        let tokens = tokens.unwrap_or(0.0);

        let last_refill = last_refill_ms
            .and_then(|ms| Timestamp::from_millisecond(ms).ok())
            .unwrap_or(Timestamp::UNIX_EPOCH);

        Ok(Some(VersionedBucket {
            bucket: Bucket { tokens, last_refill },
            version,
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        bucket: &Bucket,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;

        let expected = expected_version.unwrap_or(0);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let swapped: i64 = COMPARE_AND_SWAP
            .key(self.full_key(key))
            .key(self.version_key(key))
            .arg(expected)
            .arg(bucket.tokens)
            .arg(bucket.last_refill.as_millisecond())
            .arg(ttl_ms)
            .arg(ttl_ms.saturating_mul(2))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(swapped == 1)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;

        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Query(format!("Failed to ping Redis server: {e}")))?;

        Ok(())
    }
}
