use std::{
    collections::HashSet,
    fmt::Write,
    path::Path,
    sync::LazyLock,
};

use anyhow::bail;
use regex::Regex;
use serde::Deserialize;
use toml::Value;

use crate::{Config, KeyStrategy, RateLimitConfig, StorageConfig};

const MAX_RETRIES_CEILING: u32 = 10;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("environment reference pattern is valid")
});

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();
    let content = std::fs::read_to_string(&path)?;

    parse(&content)
}

pub(crate) fn parse(content: &str) -> anyhow::Result<Config> {
    let mut raw_config: Value = toml::from_str(content)?;
    expand_env_references(&mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;

    for warning in validate_rate_limits(&config.server.rate_limits)? {
        log::warn!("{warning}");
    }

    Ok(config)
}

/// Replaces `{{ env.NAME }}` references in every string value of the document.
fn expand_env_references<'a>(path: &mut Vec<Result<&'a str, usize>>, value: &'a mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => {
            if !ENV_REFERENCE.is_match(s) {
                return Ok(());
            }

            let mut expanded = String::with_capacity(s.len());
            let mut last = 0;

            for captures in ENV_REFERENCE.captures_iter(s) {
                let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                    continue;
                };

                let Ok(env_value) = std::env::var(name.as_str()) else {
                    bail!(
                        "Failed to expand environment variable at path '{}': {} is not set",
                        render_path(path),
                        name.as_str()
                    );
                };

                expanded.push_str(&s[last..whole.start()]);
                expanded.push_str(&env_value);
                last = whole.end();
            }

            expanded.push_str(&s[last..]);
            *s = expanded;
        }
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_env_references(path, value)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map {
                path.push(Ok(key.as_str()));
                expand_env_references(path, value)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}

fn render_path(path: &[Result<&str, usize>]) -> String {
    let mut p = String::new();

    for segment in path {
        match segment {
            Ok(s) => {
                if !p.is_empty() {
                    p.push('.');
                }
                p.push_str(s);
            }
            Err(i) => {
                let _ = write!(p, "[{i}]");
            }
        }
    }

    p
}

/// Validates the rate limit configuration and returns non-fatal warnings.
pub(crate) fn validate_rate_limits(config: &RateLimitConfig) -> anyhow::Result<Vec<String>> {
    let mut warnings = Vec::new();

    if !config.enabled {
        return Ok(warnings);
    }

    if config.store_timeout.is_zero() {
        bail!("server.rate_limits.store_timeout must be greater than zero");
    }

    if config.max_retries > MAX_RETRIES_CEILING {
        bail!(
            "server.rate_limits.max_retries is {}, the maximum is {MAX_RETRIES_CEILING}",
            config.max_retries
        );
    }

    if let StorageConfig::Redis(redis) = &config.storage {
        let url = url::Url::parse(&redis.url)
            .map_err(|e| anyhow::anyhow!("Invalid Redis URL in server.rate_limits.storage: {e}"))?;

        if !matches!(url.scheme(), "redis" | "rediss") {
            bail!(
                "Redis URL in server.rate_limits.storage must use redis:// or rediss://, got {}://",
                url.scheme()
            );
        }
    }

    let mut seen = HashSet::new();

    for (i, route) in config.routes.iter().enumerate() {
        if route.path.is_empty() || !route.path.starts_with('/') {
            bail!(
                "server.rate_limits.routes[{i}].path must start with '/', got '{}'",
                route.path
            );
        }

        if !seen.insert(route.path.as_str()) {
            bail!("Route '{}' is configured more than once in server.rate_limits.routes", route.path);
        }

        if route.limit == 0 {
            bail!("Route '{}' must have a limit of at least 1", route.path);
        }

        if route.interval.is_zero() {
            bail!("Route '{}' must have an interval greater than zero", route.path);
        }

        if route.strategy != KeyStrategy::Ip && config.identity.user_header.is_none() {
            warnings.push(format!(
                "Route '{}' uses the {} strategy but server.rate_limits.identity.user_header is not set. \
                 Users are only recognized through an AuthenticatedUser request extension.",
                route.path, route.strategy,
            ));
        }

        if let Some(prefix) = config.exempt_paths.iter().find(|prefix| route.path.starts_with(prefix.as_str())) {
            warnings.push(format!(
                "Route '{}' is never rate limited because it is covered by the exempt path '{prefix}'",
                route.path
            ));
        }
    }

    if config.routes.is_empty() {
        warnings.push("Rate limiting is enabled but no routes are configured".to_string());
    }

    Ok(warnings)
}
