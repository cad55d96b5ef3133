//! Bucket key derivation.

use config::KeyStrategy;

const MAX_COMPONENT_LEN: usize = 100;
const UNKNOWN: &str = "unknown";

/// Makes a request-derived value safe to embed in a bucket key.
///
/// Anything outside `[A-Za-z0-9._:@-]` becomes `_`, so separators, line breaks and
/// store syntax cannot leak into the key. The result is at most 100 characters, and
/// an empty value becomes `unknown`.
pub fn sanitize_component(value: &str) -> String {
    let sanitized: String = value
        .trim()
        .chars()
        .take(MAX_COMPONENT_LEN)
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | ':' | '@' | '-' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        UNKNOWN.to_string()
    } else {
        sanitized
    }
}

/// User IDs additionally lose `:`, the key separator. IPv6 addresses keep theirs, so
/// the user part always ends at the first separator after the prefix.
fn sanitize_user(value: &str) -> String {
    sanitize_component(value).replace(':', "_")
}

/// Derives the bucket key of a request for a route.
///
/// User based strategies fall back to the IP key for anonymous requests, and a
/// missing client IP is keyed as `unknown`.
pub fn resolve_key(strategy: KeyStrategy, route: &str, client_ip: Option<&str>, user_id: Option<&str>) -> String {
    let ip = sanitize_component(client_ip.unwrap_or_default());
    let user = user_id.filter(|id| !id.trim().is_empty()).map(sanitize_user);

    match (strategy, user) {
        (KeyStrategy::User, Some(user)) => format!("user:{user}:{route}"),
        (KeyStrategy::Composite, Some(user)) => format!("composite:{user}:{ip}:{route}"),
        (KeyStrategy::Ip | KeyStrategy::User | KeyStrategy::Composite, _) => format!("ip:{ip}:{route}"),
    }
}
