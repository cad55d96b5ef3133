//! The route rule table.

use std::{borrow::Cow, collections::HashMap, time::Duration};

use config::{KeyStrategy, RateLimitConfig, RouteRuleConfig};

use crate::RateLimitError;

/// A rate limit rule for the requests matching one path pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    pattern: String,
    capacity: u32,
    interval: Duration,
    strategy: KeyStrategy,
}

impl RouteRule {
    /// Creates a rule, rejecting limits that could never refill.
    pub fn new(
        pattern: impl Into<String>,
        capacity: u32,
        interval: Duration,
        strategy: KeyStrategy,
    ) -> Result<Self, RateLimitError> {
        let pattern = pattern.into();

        if capacity == 0 {
            return Err(RateLimitError::Config(format!(
                "route '{pattern}' must have a limit of at least 1"
            )));
        }

        if interval.is_zero() {
            return Err(RateLimitError::Config(format!(
                "route '{pattern}' must have an interval greater than zero"
            )));
        }

        Ok(Self {
            pattern,
            capacity,
            interval,
            strategy,
        })
    }

    /// The configured path or glob, also used as the route component of bucket keys.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Time to refill an empty bucket.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How bucket keys are derived for this route.
    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Tokens added per second.
    pub fn refill_rate_per_second(&self) -> f64 {
        f64::from(self.capacity) / self.interval.as_secs_f64()
    }

    /// How long an idle bucket is kept by the store.
    pub fn bucket_ttl(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    fn is_glob(&self) -> bool {
        is_glob(&self.pattern)
    }
}

impl TryFrom<&RouteRuleConfig> for RouteRule {
    type Error = RateLimitError;

    fn try_from(config: &RouteRuleConfig) -> Result<Self, Self::Error> {
        Self::new(config.path.clone(), config.limit, config.interval, config.strategy)
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.chars().any(|c| "?*[]{}!\\".contains(c))
}

/// Collapses repeated slashes and drops a trailing slash, so `//login/` and `/login`
/// resolve to the same rule.
fn normalize_path(path: &str) -> Cow<'_, str> {
    if !path.contains("//") && !(path.len() > 1 && path.ends_with('/')) {
        return Cow::Borrowed(path);
    }

    let mut normalized = String::with_capacity(path.len());

    for c in path.chars() {
        if c == '/' && normalized.ends_with('/') {
            continue;
        }

        normalized.push(c);
    }

    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    Cow::Owned(normalized)
}

/// An immutable snapshot of the route rules and exempt paths.
///
/// Exact paths win over globs, and globs are tried in the order they were declared.
#[derive(Debug, Default)]
pub struct RouteTable {
    exact: HashMap<String, RouteRule>,
    globs: Vec<RouteRule>,
    exempt_paths: Vec<String>,
}

impl RouteTable {
    /// Builds a table from rules and exempt path prefixes.
    pub fn new(rules: Vec<RouteRule>, exempt_paths: Vec<String>) -> Result<Self, RateLimitError> {
        let mut exact = HashMap::new();
        let mut globs: Vec<RouteRule> = Vec::new();

        for rule in rules {
            let duplicate = if rule.is_glob() {
                globs.iter().any(|glob| glob.pattern == rule.pattern)
            } else {
                exact.contains_key(normalize_path(&rule.pattern).as_ref())
            };

            if duplicate {
                return Err(RateLimitError::Config(format!(
                    "route '{}' is configured more than once",
                    rule.pattern
                )));
            }

            if rule.is_glob() {
                globs.push(rule);
            } else {
                exact.insert(normalize_path(&rule.pattern).into_owned(), rule);
            }
        }

        Ok(Self {
            exact,
            globs,
            exempt_paths,
        })
    }

    /// Builds a table from the rate limit configuration.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let rules = config
            .routes
            .iter()
            .map(RouteRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(rules, config.exempt_paths.clone())
    }

    /// The rule governing `path`, if any.
    pub fn find(&self, path: &str) -> Option<&RouteRule> {
        let path = normalize_path(path);

        if let Some(rule) = self.exact.get(path.as_ref()) {
            return Some(rule);
        }

        self.globs.iter().find(|rule| fast_glob::glob_match(&rule.pattern, path.as_ref()))
    }

    /// Whether `path` bypasses rate limiting entirely.
    pub fn is_exempt(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.exempt_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.exact.len() + self.globs.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
