//! Distributed token bucket rate limiting for tollgate.
//!
//! Requests are matched against route rules, keyed by client IP, user or both, and
//! admitted against a token bucket kept in memory or in Redis. Bucket updates are
//! optimistic compare-and-swap cycles, so any number of instances can share one
//! Redis without admitting more than a bucket's capacity.
//!
//! When the store cannot be reached the manager switches to the DEGRADED policy and
//! applies the configured failure mode, by default letting requests through.

#![deny(missing_docs)]

mod bucket;
mod clock;
mod error;
mod key;
mod manager;
mod policy;
mod request;
mod route;
mod storage;

pub use bucket::{Bucket, RateLimitResult, evaluate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::RateLimitError;
pub use key::{resolve_key, sanitize_component};
pub use manager::{RateLimitDecision, RateLimitManager, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
pub use policy::{HealthReport, PolicyState};
pub use request::{RateLimitRequest, RateLimitRequestBuilder};
pub use route::{RouteRule, RouteTable};
pub use storage::{
    BucketStorage, BucketStoreClient, InMemoryStorage, RedisStorage, Storage, StorageError, VersionedBucket,
};
