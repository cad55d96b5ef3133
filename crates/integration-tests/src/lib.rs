//! Test harness serving a demo application through the tollgate server.

#![allow(clippy::panic)]

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    routing::{get, post},
};
use config::Config;
use serde_json::json;
use server::ServeConfig;
use tokio::{net::TcpListener, time::timeout};

/// Test client for making HTTP requests to the test server
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
}

impl TestClient {
    /// Create a new test client for the given base URL
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Start building a request to the given path
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.request(reqwest::Method::GET, path).send().await.unwrap()
    }

    /// Send a POST request to the given path
    pub async fn post(&self, path: &str) -> reqwest::Response {
        self.request(reqwest::Method::POST, path).send().await.unwrap()
    }
}

/// The application protected by the rate limiter in tests.
pub fn demo_app() -> Router {
    Router::new()
        .route("/api/auth/login", post(|| async { Json(json!({ "token": "secret" })) }))
        .route("/api/auth/logout", post(|| async { "bye" }))
        .route("/api/profile", get(|| async { "profile" }))
        .route("/api/orders/{id}", get(|| async { "order" }))
        .route("/contact", post(|| async { "thanks" }))
        .route("/docs", get(|| async { "docs" }))
        .route("/", get(|| async { "home" }))
}

/// Test server that manages the lifecycle of a server instance
pub struct TestServer {
    pub client: TestClient,
    pub address: SocketAddr,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a new test server with the given TOML configuration
    pub async fn start(config_toml: &str) -> Self {
        let config: Config = toml::from_str(config_toml).unwrap();

        for warning in config.validate().unwrap() {
            eprintln!("configuration warning: {warning}");
        }

        Self::start_with_config(config).await
    }

    /// Start a new test server with an already parsed configuration
    pub async fn start_with_config(config: Config) -> Self {
        // Find an available port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let serve_config = ServeConfig {
            listen_address: address,
            config,
            config_path: None,
            app: demo_app(),
        };

        let (tx, mut rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            // Drop the listener so the server can bind to the address
            drop(listener);

            let result = server::serve(serve_config).await;
            let _ = tx.send(result);
        });

        let client = TestClient::new(format!("http://{address}"));

        // Wait until the server answers, or fail with its startup error
        for _ in 0..50 {
            if let Ok(Err(e)) = rx.try_recv() {
                panic!("Server failed to start: {e}");
            }

            if let Ok(Ok(_)) = timeout(Duration::from_millis(100), client.request(reqwest::Method::GET, "/").send()).await {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestServer {
            client,
            address,
            _handle: handle,
        }
    }
}

/// The rate limit headers of a response, as JSON for snapshots. The reset time is
/// left out because it depends on the wall clock.
pub fn rate_limit_headers(response: &reqwest::Response) -> serde_json::Value {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    json!({
        "status": response.status().as_u16(),
        "limit": header("x-ratelimit-limit"),
        "remaining": header("x-ratelimit-remaining"),
        "retry_after": header("retry-after"),
    })
}

/// Epoch seconds of the `X-RateLimit-Reset` header.
pub fn reset_at(response: &reqwest::Response) -> Option<i64> {
    response.headers().get("x-ratelimit-reset")?.to_str().ok()?.parse().ok()
}

/// Current time in epoch seconds.
pub fn now() -> i64 {
    jiff::Timestamp::now().as_second()
}
