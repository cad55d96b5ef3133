//! Storage backends for bucket state.

use std::time::Duration;

use crate::bucket::Bucket;

mod client;
pub mod memory;
pub mod redis;
mod redis_pool;

pub use client::BucketStoreClient;
pub use memory::InMemoryStorage;
pub use redis::RedisStorage;

/// A bucket together with the version it was stored under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionedBucket {
    /// The stored bucket.
    pub bucket: Bucket,
    /// Incremented on every write. Never zero for a stored bucket.
    pub version: u64,
}

/// A store of versioned buckets with compare-and-swap writes.
#[allow(async_fn_in_trait)]
pub trait BucketStorage: Send + Sync {
    /// Short backend name used in logs and metrics.
    fn backend(&self) -> &'static str;

    /// Reads a bucket. Expired buckets are absent.
    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>, StorageError>;

    /// Writes `bucket` with the given expiry if the stored version still equals
    /// `expected_version`, where `None` means the bucket must not exist.
    ///
    /// Returns false without writing if someone else wrote the bucket in between.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        bucket: &Bucket,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Checks that the store answers.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// Storage backend selected by configuration.
pub enum Storage {
    /// Process-local buckets.
    Memory(InMemoryStorage),
    /// Buckets shared through Redis.
    Redis(RedisStorage),
}

impl BucketStorage for Storage {
    fn backend(&self) -> &'static str {
        match self {
            Storage::Memory(storage) => storage.backend(),
            Storage::Redis(storage) => storage.backend(),
        }
    }

    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>, StorageError> {
        match self {
            Storage::Memory(storage) => storage.load(key).await,
            Storage::Redis(storage) => storage.load(key).await,
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        bucket: &Bucket,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        match self {
            Storage::Memory(storage) => storage.compare_and_swap(key, expected_version, bucket, ttl).await,
            Storage::Redis(storage) => storage.compare_and_swap(key, expected_version, bucket, ttl).await,
        }
    }

    async fn ping(&self) -> Result<(), StorageError> {
        match self {
            Storage::Memory(storage) => storage.ping().await,
            Storage::Redis(storage) => storage.ping().await,
        }
    }
}

/// Errors that can occur in storage backends.
///
/// Every variant means the store could not be used for this decision.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Query error: {0}")]
    Query(String),

    /// The store did not answer in time.
    #[error("Store did not answer within {0:?}")]
    Timeout(Duration),

    /// The bucket kept changing under concurrent writers.
    #[error("Bucket update lost the race {attempts} times in a row")]
    Contention {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Internal storage error.
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Connection(_) => "connection",
            StorageError::Query(_) => "query",
            StorageError::Timeout(_) => "timeout",
            StorageError::Contention { .. } => "contention",
            StorageError::Internal(_) => "internal",
        }
    }
}
