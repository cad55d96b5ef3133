//! Rate limiting middleware for HTTP requests.

use std::{
    fmt::Display,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{body::Body, extract::ConnectInfo};
use http::{HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE};
use rate_limit::{RateLimitDecision, RateLimitManager, RateLimitRequest};
use tower::Layer;

/// The authenticated user of a request.
///
/// An authentication layer running before the rate limiter inserts this into the
/// request extensions. It takes precedence over the configured user header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Applies the route rules of a [`RateLimitManager`] to every request.
#[derive(Clone)]
pub struct RateLimitLayer(Arc<RateLimitManager>);

impl RateLimitLayer {
    /// Create a layer sharing the given manager.
    pub fn new(manager: Arc<RateLimitManager>) -> Self {
        Self(manager)
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            manager: self.0.clone(),
        }
    }
}

/// Service created by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    manager: Arc<RateLimitManager>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let manager = self.manager.clone();

        Box::pin(async move {
            let decision = manager.check(&rate_limit_request(&req)).await;

            if !decision.should_forward {
                return Ok(rejection(decision));
            }

            let mut response = next.call(req).await?;
            response.headers_mut().extend(decision.response_headers);

            Ok(response)
        })
    }
}

fn rate_limit_request<B>(req: &Request<B>) -> RateLimitRequest {
    let mut builder = RateLimitRequest::builder()
        .method(req.method().clone())
        .path(req.uri().path())
        .headers(req.headers().clone());

    // Only reachable when the server is started with connect info.
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        builder = builder.client_ip(addr.ip().to_string());
    }

    if let Some(AuthenticatedUser(user)) = req.extensions().get::<AuthenticatedUser>() {
        builder = builder.user_id(user.clone());
    }

    builder.build()
}

fn rejection(decision: RateLimitDecision) -> Response<Body> {
    let body = decision.response_body.unwrap_or_default();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = decision.response_status.unwrap_or(StatusCode::TOO_MANY_REQUESTS);

    response.headers_mut().extend(decision.response_headers);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    response
}
