//! Request information for rate limiting.

use http::{HeaderMap, Method};

/// A normalized view of an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RateLimitRequest {
    /// HTTP method.
    pub method: Method,
    /// Request path without the query string.
    pub path: String,
    /// Client IP as seen by the trusted edge.
    pub client_ip: Option<String>,
    /// Authenticated user ID, if the request is authenticated.
    pub user_id: Option<String>,
    /// Request headers.
    pub headers: HeaderMap,
}

impl RateLimitRequest {
    /// Create a new builder for a rate limit request.
    pub fn builder() -> RateLimitRequestBuilder {
        RateLimitRequestBuilder::default()
    }
}

/// Builder for creating rate limit requests.
#[derive(Debug, Default)]
pub struct RateLimitRequestBuilder {
    request: RateLimitRequest,
}

impl RateLimitRequestBuilder {
    /// Set the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.request.method = method;
        self
    }

    /// Set the request path. A query string is removed.
    pub fn path(mut self, path: impl AsRef<str>) -> Self {
        let path = path.as_ref();
        let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);

        self.request.path = path.to_string();
        self
    }

    /// Set the client IP.
    pub fn client_ip(mut self, ip: impl Into<String>) -> Self {
        self.request.client_ip = Some(ip.into());
        self
    }

    /// Set the authenticated user ID.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.request.user_id = Some(user_id.into());
        self
    }

    /// Set the request headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.request.headers = headers;
        self
    }

    /// Build the rate limit request.
    pub fn build(self) -> RateLimitRequest {
        self.request
    }
}
