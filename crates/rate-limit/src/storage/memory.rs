//! In-memory bucket storage.
//!
//! Buckets live in this process only, so limits are enforced per instance. Suitable for
//! single instance deployments and tests.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

use super::{BucketStorage, StorageError, VersionedBucket};
use crate::bucket::Bucket;

/// Every this many writes, expired buckets are removed from the map.
const SWEEP_INTERVAL: u64 = 1024;

struct StoredBucket {
    bucket: Bucket,
    version: u64,
    expires_at: Instant,
}

impl StoredBucket {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory bucket storage implementation.
#[derive(Default)]
pub struct InMemoryStorage {
    buckets: DashMap<String, StoredBucket>,
    writes: AtomicU64,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets held, including expired ones not swept yet.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets are held.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Removes every expired bucket.
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.buckets.len();

        self.buckets.retain(|_, stored| stored.is_live(now));

        let removed = before.saturating_sub(self.buckets.len());

        if removed > 0 {
            log::debug!("Removed {removed} expired buckets from memory storage");
        }
    }
}

impl BucketStorage for InMemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>, StorageError> {
        let now = Instant::now();

        let bucket = self
            .buckets
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| VersionedBucket {
                bucket: stored.bucket,
                version: stored.version,
            });

        Ok(bucket)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        bucket: &Bucket,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        let expires_at = now + ttl;

        let swapped = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                let current = stored.is_live(now).then_some(stored.version);

                if current == expected_version {
                    // Versions keep growing across expiry so a stale reader never matches.
                    stored.version += 1;
                    stored.bucket = *bucket;
                    stored.expires_at = expires_at;

                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) if expected_version.is_none() => {
                vacant.insert(StoredBucket {
                    bucket: *bucket,
                    version: 1,
                    expires_at,
                });

                true
            }
            Entry::Vacant(_) => false,
        };

        if swapped && self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep();
        }

        Ok(swapped)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
