//! Rate limiting configuration structures.

use std::{fmt, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Rate limiting configuration for the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// What to do with a request when the storage backend cannot be reached.
    pub failure_mode: FailureMode,
    /// Upper bound for the store round trips of a single rate limit decision.
    #[serde(deserialize_with = "deserialize_duration")]
    pub store_timeout: Duration,
    /// Number of compare-and-swap retries after the first attempt.
    pub max_retries: u32,
    /// Trusted headers used to identify the client.
    pub identity: IdentityConfig,
    /// Path prefixes that are never rate limited.
    pub exempt_paths: Vec<String>,
    /// Per-route rate limit rules.
    pub routes: Vec<RouteRuleConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage: StorageConfig::default(),
            failure_mode: FailureMode::default(),
            store_timeout: Duration::from_millis(100),
            max_retries: 3,
            identity: IdentityConfig::default(),
            exempt_paths: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// A single route rule: which requests it applies to and how many of them are admitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRuleConfig {
    /// Exact request path (`/api/auth/login`) or glob pattern (`/api/auth/*`).
    pub path: String,
    /// Bucket capacity: the maximum number of requests admitted per interval.
    pub limit: u32,
    /// Time needed to refill an empty bucket to full capacity.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// How the bucket key is derived from the request.
    #[serde(default)]
    pub strategy: KeyStrategy,
}

/// Strategy used to derive a bucket key from a request.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// One bucket per client IP address.
    #[default]
    Ip,
    /// One bucket per authenticated user, per IP for anonymous requests.
    User,
    /// One bucket per user and IP pair, per IP for anonymous requests.
    #[serde(alias = "combined")]
    Composite,
}

impl KeyStrategy {
    /// The lowercase name used in configuration and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::User => "user",
            KeyStrategy::Composite => "composite",
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavior when the storage backend is unavailable.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let requests through unthrottled.
    #[default]
    Open,
    /// Reject requests as if the limit was exceeded.
    Closed,
}

/// Trusted request headers used to identify the client.
///
/// These headers must be set (and overwritten) by the edge proxy in front of the service,
/// otherwise clients can choose their own bucket.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Header carrying the client IP. The socket peer address is used when unset.
    pub ip_header: Option<String>,
    /// Header carrying the authenticated user ID.
    pub user_header: Option<String>,
    /// Header carrying the original request URI in forward-auth deployments.
    pub forwarded_uri_header: Option<String>,
    /// Header carrying the original request method in forward-auth deployments.
    pub forwarded_method_header: Option<String>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default).
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Redis storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// TLS configuration.
    pub tls: Option<RedisTlsConfig>,
    /// Key prefix for all bucket keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Timeout for establishing a new connection.
    #[serde(default = "default_connection_timeout", deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
}

fn default_key_prefix() -> String {
    "tollgate:rate_limit:".to_string()
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            pool: RedisPoolConfig::default(),
            tls: None,
            key_prefix: default_key_prefix(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout for recycling idle connections.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Redis TLS configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Enable TLS with the certificates below.
    pub enabled: bool,
    /// Path to CA certificate file.
    pub ca_cert_path: Option<String>,
    /// Path to client certificate file (for mutual TLS).
    pub client_cert_path: Option<String>,
    /// Path to client key file (for mutual TLS).
    pub client_key_path: Option<String>,
}
