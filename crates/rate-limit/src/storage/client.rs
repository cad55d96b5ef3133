//! Atomic bucket updates on top of compare-and-swap storage.

use std::time::Duration;

use telemetry::metrics::{RATE_LIMIT_STORE_DURATION, Recorder};

use super::{BucketStorage, StorageError};
use crate::bucket::Bucket;

/// Runs read-evaluate-write cycles against a [`BucketStorage`] so that concurrent
/// requests for one key never both apply an update computed from the same snapshot.
pub struct BucketStoreClient<S> {
    storage: S,
    max_retries: u32,
    timeout: Duration,
}

impl<S: BucketStorage> BucketStoreClient<S> {
    /// Creates a client retrying lost races up to `max_retries` times, with `timeout`
    /// bounding the whole update including retries.
    pub fn new(storage: S, max_retries: u32, timeout: Duration) -> Self {
        Self {
            storage,
            max_retries,
            timeout,
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Applies `update` to the current bucket for `key` and persists the result with
    /// the given expiry.
    ///
    /// `update` may run more than once, always against fresh state, so it must be free
    /// of side effects. The value it returns with the bucket that was finally stored is
    /// returned.
    pub async fn atomic_update<F, R>(&self, key: &str, ttl: Duration, update: F) -> Result<R, StorageError>
    where
        F: Fn(Option<&Bucket>) -> (Bucket, R),
    {
        let mut recorder = Recorder::new(RATE_LIMIT_STORE_DURATION);
        recorder.push_attribute("backend", self.storage.backend());

        let result = match tokio::time::timeout(self.timeout, self.update_with_retries(key, ttl, &update)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.timeout)),
        };

        match &result {
            Ok(_) => recorder.push_attribute("status", "ok"),
            Err(e) => recorder.push_attribute("status", e.kind()),
        }

        recorder.record();

        result
    }

    /// Pings the store within the client timeout.
    pub async fn ping(&self) -> Result<(), StorageError> {
        match tokio::time::timeout(self.timeout, self.storage.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.timeout)),
        }
    }

    async fn update_with_retries<F, R>(&self, key: &str, ttl: Duration, update: &F) -> Result<R, StorageError>
    where
        F: Fn(Option<&Bucket>) -> (Bucket, R),
    {
        let attempts = self.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let current = self.storage.load(key).await?;
            let expected_version = current.as_ref().map(|stored| stored.version);

            let (bucket, output) = update(current.as_ref().map(|stored| &stored.bucket));

            if self.storage.compare_and_swap(key, expected_version, &bucket, ttl).await? {
                return Ok(output);
            }

            log::debug!("Bucket '{key}' was updated concurrently (attempt {attempt} of {attempts})");
        }

        Err(StorageError::Contention { attempts })
    }
}
