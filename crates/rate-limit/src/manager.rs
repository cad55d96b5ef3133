//! Rate limit manager implementation.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use config::{FailureMode, IdentityConfig, RateLimitConfig, StorageConfig};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::RETRY_AFTER};
use jiff::Timestamp;
use telemetry::{Counter, KeyValue, metrics::RATE_LIMIT_DECISIONS};

use crate::{
    bucket::{RateLimitResult, evaluate},
    clock::{Clock, SystemClock},
    error::RateLimitError,
    key::resolve_key,
    policy::{HealthReport, PolicyMonitor, PolicyState},
    request::RateLimitRequest,
    route::{RouteRule, RouteTable},
    storage::{BucketStorage, BucketStoreClient, InMemoryStorage, RedisStorage, Storage},
};

/// Header carrying the bucket capacity.
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the whole tokens left.
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the reset time in epoch seconds.
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// What to do with a request after rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request goes on to the application.
    pub should_forward: bool,
    /// Headers to add to the response, forwarded or not.
    pub response_headers: HeaderMap,
    /// Status of the rejection response.
    pub response_status: Option<StatusCode>,
    /// Body of the rejection response.
    pub response_body: Option<Vec<u8>>,
}

impl RateLimitDecision {
    /// Forward the request untouched.
    pub fn forward() -> Self {
        Self {
            should_forward: true,
            response_headers: HeaderMap::new(),
            response_status: None,
            response_body: None,
        }
    }

    fn from_result(result: &RateLimitResult) -> Self {
        let mut response_headers = HeaderMap::with_capacity(4);

        response_headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(result.limit));
        response_headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(result.remaining));
        response_headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(result.reset_at));

        let Some(retry_after) = result.retry_after.filter(|_| !result.allowed) else {
            return Self {
                should_forward: true,
                response_headers,
                response_status: None,
                response_body: None,
            };
        };

        response_headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

        let body = serde_json::json!({
            "error": "rate_limit_exceeded",
            "retry_after": retry_after,
        });

        Self {
            should_forward: false,
            response_headers,
            response_status: Some(StatusCode::TOO_MANY_REQUESTS),
            response_body: Some(body.to_string().into_bytes()),
        }
    }
}

/// Applies the route rules to requests.
///
/// Store faults never surface as errors: they are absorbed by the configured failure
/// mode and tracked as the NORMAL/DEGRADED policy state.
pub struct RateLimitManager<S = Storage> {
    routes: ArcSwap<RouteTable>,
    client: BucketStoreClient<S>,
    clock: Arc<dyn Clock>,
    policy: PolicyMonitor,
    failure_mode: FailureMode,
    identity: IdentityConfig,
    decisions: Counter<u64>,
}

impl RateLimitManager {
    /// Create a new rate limit manager with the configured storage backend.
    pub async fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let storage = match &config.storage {
            StorageConfig::Memory => Storage::Memory(InMemoryStorage::new()),
            StorageConfig::Redis(redis_config) => Storage::Redis(RedisStorage::new(redis_config).await?),
        };

        Self::with_storage(config, storage, SystemClock)
    }
}

impl<S: BucketStorage> RateLimitManager<S> {
    /// Create a manager on top of the given storage and clock.
    pub fn with_storage(config: &RateLimitConfig, storage: S, clock: impl Clock + 'static) -> Result<Self, RateLimitError> {
        let routes = RouteTable::from_config(config)?;

        log::debug!(
            "Rate limiting {} routes with {} storage, failing {}",
            routes.len(),
            storage.backend(),
            match config.failure_mode {
                FailureMode::Open => "open",
                FailureMode::Closed => "closed",
            }
        );

        let decisions = telemetry::metrics::meter()
            .u64_counter(RATE_LIMIT_DECISIONS)
            .with_description("Rate limit decisions by route, strategy and outcome")
            .build();

        Ok(Self {
            routes: ArcSwap::from_pointee(routes),
            client: BucketStoreClient::new(storage, config.max_retries, config.store_timeout),
            clock: Arc::new(clock),
            policy: PolicyMonitor::default(),
            failure_mode: config.failure_mode,
            identity: config.identity.clone(),
            decisions,
        })
    }

    /// Decides whether a request is admitted.
    pub async fn check(&self, request: &RateLimitRequest) -> RateLimitDecision {
        let routes = self.routes.load_full();
        let (method, path) = self.target(request);

        if routes.is_exempt(&path) {
            return RateLimitDecision::forward();
        }

        let Some(rule) = routes.find(&path) else {
            return RateLimitDecision::forward();
        };

        let key = resolve_key(
            rule.strategy(),
            rule.pattern(),
            self.client_ip(request),
            self.user_id(request),
        );

        let capacity = rule.capacity();
        let rate = rule.refill_rate_per_second();

        let outcome = self
            .client
            .atomic_update(&key, rule.bucket_ttl(), |prior| {
                evaluate(prior, self.clock.now(), capacity, rate)
            })
            .await;

        match outcome {
            Ok(result) => {
                self.policy.record_success();

                if result.allowed {
                    self.count(rule, "allowed");
                } else {
                    log::debug!(
                        "Rate limit exceeded for {method} {path} with key '{key}', retry after {}s",
                        result.retry_after.unwrap_or_default()
                    );

                    self.count(rule, "denied");
                }

                RateLimitDecision::from_result(&result)
            }
            Err(e) => {
                log::warn!(
                    "Rate limit store unavailable for key '{key}' on route '{}': {e}",
                    rule.pattern()
                );

                self.policy.record_failure(&e);
                self.store_unavailable(rule)
            }
        }
    }

    /// Probes the store and reports the policy state.
    pub async fn health(&self) -> HealthReport {
        let store_reachable = match self.client.ping().await {
            Ok(()) => {
                self.policy.record_success();
                true
            }
            Err(e) => {
                log::warn!("Rate limit store health probe failed: {e}");
                self.policy.record_failure(&e);
                false
            }
        };

        HealthReport {
            store_reachable,
            current_policy: self.policy.state(),
        }
    }

    /// The current policy state, without probing the store.
    pub fn policy_state(&self) -> PolicyState {
        self.policy.state()
    }

    /// Replaces the route rules and exempt paths. Readers see either the old or the
    /// new table, never a mix. Storage, identity and failure mode are not reloaded.
    pub fn reload(&self, config: &RateLimitConfig) -> Result<(), RateLimitError> {
        let routes = RouteTable::from_config(config)?;
        let count = routes.len();

        self.routes.store(Arc::new(routes));

        log::info!("Reloaded rate limit configuration with {count} routes");

        Ok(())
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        self.client.storage()
    }

    fn store_unavailable(&self, rule: &RouteRule) -> RateLimitDecision {
        let interval = rule.interval();
        let reset_at = self.reset_after(interval);

        match self.failure_mode {
            FailureMode::Open => {
                self.count(rule, "fail_open");

                RateLimitDecision::from_result(&RateLimitResult {
                    allowed: true,
                    limit: rule.capacity(),
                    remaining: rule.capacity(),
                    reset_at,
                    retry_after: None,
                })
            }
            FailureMode::Closed => {
                self.count(rule, "fail_closed");

                RateLimitDecision::from_result(&RateLimitResult {
                    allowed: false,
                    limit: rule.capacity(),
                    remaining: 0,
                    reset_at,
                    retry_after: Some(interval.as_secs_f64().ceil().max(1.0) as u64),
                })
            }
        }
    }

    fn reset_after(&self, interval: Duration) -> i64 {
        let reset = self.clock.now().as_millisecond() as f64 / 1000.0 + interval.as_secs_f64();
        reset.ceil() as i64
    }

    /// The method and path to match rules against. In forward-auth deployments these
    /// come from headers set by the proxy.
    fn target(&self, request: &RateLimitRequest) -> (Method, String) {
        let method = self
            .trusted_header(request, self.identity.forwarded_method_header.as_deref())
            .and_then(|method| Method::from_bytes(method.trim().as_bytes()).ok())
            .unwrap_or_else(|| request.method.clone());

        let path = self
            .trusted_header(request, self.identity.forwarded_uri_header.as_deref())
            .map(|uri| uri.split_once('?').map(|(path, _)| path).unwrap_or(uri).to_string())
            .unwrap_or_else(|| request.path.clone());

        (method, path)
    }

    fn client_ip<'a>(&self, request: &'a RateLimitRequest) -> Option<&'a str> {
        match self.identity.ip_header.as_deref() {
            // Proxies append to forwarding headers, so the last entry is the one the
            // trusted edge added.
            Some(name) => self
                .trusted_header(request, Some(name))
                .and_then(|value| value.rsplit(',').next())
                .map(str::trim)
                .filter(|ip| !ip.is_empty()),
            None => request.client_ip.as_deref(),
        }
    }

    fn user_id<'a>(&self, request: &'a RateLimitRequest) -> Option<&'a str> {
        request
            .user_id
            .as_deref()
            .or_else(|| self.trusted_header(request, self.identity.user_header.as_deref()))
    }

    fn trusted_header<'a>(&self, request: &'a RateLimitRequest, name: Option<&str>) -> Option<&'a str> {
        request.headers.get(name?)?.to_str().ok()
    }

    fn count(&self, rule: &RouteRule, outcome: &'static str) {
        self.decisions.add(
            1,
            &[
                KeyValue::new("route", rule.pattern().to_string()),
                KeyValue::new("strategy", rule.strategy().as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}
