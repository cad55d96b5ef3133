use std::time::Duration;

use indoc::indoc;
use integration_tests::{TestServer, now, rate_limit_headers, reset_at};
use serde_json::Value;

const LOGIN: &str = indoc! {r#"
    [server.rate_limits]
    enabled = true

    [[server.rate_limits.routes]]
    path = "/api/auth/login"
    limit = 5
    interval = "60s"
"#};

#[tokio::test]
async fn login_burst_is_limited() {
    let server = TestServer::start(LOGIN).await;
    let mut responses = Vec::new();

    for _ in 0..6 {
        let response = server.client.post("/api/auth/login").await;
        responses.push(rate_limit_headers(&response));
    }

    insta::assert_json_snapshot!(responses, @r#"
    [
      {
        "limit": "5",
        "remaining": "4",
        "retry_after": null,
        "status": 200
      },
      {
        "limit": "5",
        "remaining": "3",
        "retry_after": null,
        "status": 200
      },
      {
        "limit": "5",
        "remaining": "2",
        "retry_after": null,
        "status": 200
      },
      {
        "limit": "5",
        "remaining": "1",
        "retry_after": null,
        "status": 200
      },
      {
        "limit": "5",
        "remaining": "0",
        "retry_after": null,
        "status": 200
      },
      {
        "limit": "5",
        "remaining": "0",
        "retry_after": "12",
        "status": 429
      }
    ]
    "#);
}

#[tokio::test]
async fn rejection_body_is_json() {
    let server = TestServer::start(LOGIN).await;

    for _ in 0..5 {
        let response = server.client.post("/api/auth/login").await;
        assert_eq!(response.status(), 200);
    }

    let response = server.client.post("/api/auth/login").await;
    assert_eq!(response.status(), 429);

    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
    assert_eq!(content_type, "application/json");

    let body: Value = response.json().await.unwrap();
    insta::assert_json_snapshot!(body, @r#"
    {
      "error": "rate_limit_exceeded",
      "retry_after": 12
    }
    "#);
}

#[tokio::test]
async fn reset_header_points_into_the_future() {
    let server = TestServer::start(LOGIN).await;
    let before = now();

    let response = server.client.post("/api/auth/login").await;
    let reset = reset_at(&response).unwrap();

    // The bucket was drained by one token, which refills in 12 seconds.
    assert!(reset > before, "reset {reset} is not after {before}");
    assert!(reset <= now() + 13, "reset {reset} is too far away");
}

#[tokio::test]
async fn bucket_refills_after_cooldown() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true

        [[server.rate_limits.routes]]
        path = "/contact"
        limit = 2
        interval = "2s"
    "#};

    let server = TestServer::start(config).await;

    assert_eq!(server.client.post("/contact").await.status(), 200);
    assert_eq!(server.client.post("/contact").await.status(), 200);

    let denied = server.client.post("/contact").await;
    assert_eq!(denied.status(), 429);

    let retry_after = denied.headers().get("retry-after").unwrap().to_str().unwrap();
    assert_eq!(retry_after, "1");

    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(server.client.post("/contact").await.status(), 200);
}

#[tokio::test]
async fn unmatched_and_exempt_paths_are_not_limited() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true
        exempt_paths = ["/docs"]

        [[server.rate_limits.routes]]
        path = "/docs"
        limit = 1
        interval = "60s"

        [[server.rate_limits.routes]]
        path = "/api/auth/login"
        limit = 1
        interval = "60s"
    "#};

    let server = TestServer::start(config).await;

    for _ in 0..3 {
        let response = server.client.get("/docs").await;
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("x-ratelimit-limit").is_none());

        let response = server.client.get("/api/profile").await;
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn glob_routes_share_one_bucket() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true

        [[server.rate_limits.routes]]
        path = "/api/orders/*"
        limit = 3
        interval = "60s"
    "#};

    let server = TestServer::start(config).await;

    let statuses = [
        server.client.get("/api/orders/1").await.status().as_u16(),
        server.client.get("/api/orders/2").await.status().as_u16(),
        server.client.get("/api/orders/3").await.status().as_u16(),
        server.client.get("/api/orders/4").await.status().as_u16(),
    ];

    assert_eq!(statuses, [200, 200, 200, 429]);
}

#[tokio::test]
async fn users_have_separate_buckets() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true

        [server.rate_limits.identity]
        user_header = "X-User-Id"

        [[server.rate_limits.routes]]
        path = "/api/profile"
        limit = 2
        interval = "60s"
        strategy = "user"
    "#};

    let server = TestServer::start(config).await;

    let profile = |user: &'static str| {
        server
            .client
            .request(reqwest::Method::GET, "/api/profile")
            .header("X-User-Id", user)
            .send()
    };

    assert_eq!(profile("alice").await.unwrap().status(), 200);
    assert_eq!(profile("alice").await.unwrap().status(), 200);
    assert_eq!(profile("alice").await.unwrap().status(), 429);

    // Same client address, different user
    assert_eq!(profile("bob").await.unwrap().status(), 200);

    // Anonymous requests fall back to the client address
    assert_eq!(server.client.get("/api/profile").await.status(), 200);
}

#[tokio::test]
async fn trusted_ip_header_selects_the_bucket() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true

        [server.rate_limits.identity]
        ip_header = "X-Forwarded-For"

        [[server.rate_limits.routes]]
        path = "/api/profile"
        limit = 2
        interval = "60s"
    "#};

    let server = TestServer::start(config).await;

    let profile = |forwarded_for: &'static str| {
        server
            .client
            .request(reqwest::Method::GET, "/api/profile")
            .header("X-Forwarded-For", forwarded_for)
            .send()
    };

    assert_eq!(profile("198.51.100.1").await.unwrap().status(), 200);
    assert_eq!(profile("198.51.100.1").await.unwrap().status(), 200);
    assert_eq!(profile("198.51.100.1").await.unwrap().status(), 429);

    // The entry added by the trusted proxy is the last one
    assert_eq!(profile("203.0.113.9, 198.51.100.1").await.unwrap().status(), 429);

    assert_eq!(profile("198.51.100.2").await.unwrap().status(), 200);
}

#[tokio::test]
async fn forward_auth_headers_select_the_route() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true

        [server.rate_limits.identity]
        forwarded_uri_header = "X-Forwarded-Uri"
        forwarded_method_header = "X-Forwarded-Method"

        [[server.rate_limits.routes]]
        path = "/api/auth/login"
        limit = 1
        interval = "60s"
    "#};

    let server = TestServer::start(config).await;

    let verify = || {
        server
            .client
            .request(reqwest::Method::GET, "/")
            .header("X-Forwarded-Uri", "/api/auth/login?next=/home")
            .header("X-Forwarded-Method", "POST")
            .send()
    };

    let response = verify().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "1");

    assert_eq!(verify().await.unwrap().status(), 429);

    // Without the forwarded URI the request targets the verification endpoint itself
    assert_eq!(server.client.get("/").await.status(), 200);
}

#[tokio::test]
async fn unreachable_store_fails_open() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true
        failure_mode = "open"
        store_timeout = "200ms"

        [server.rate_limits.storage]
        type = "redis"
        url = "redis://127.0.0.1:1/0"
        connection_timeout = "100ms"

        [[server.rate_limits.routes]]
        path = "/api/auth/login"
        limit = 5
        interval = "60s"
    "#};

    let server = TestServer::start(config).await;

    for _ in 0..7 {
        let response = server.client.post("/api/auth/login").await;
        assert_eq!(response.status(), 200);

        let headers = rate_limit_headers(&response);
        assert_eq!(headers["remaining"], "5");
    }

    let health: Value = server.client.get("/health").await.json().await.unwrap();
    insta::assert_json_snapshot!(health, @r#"
    {
      "currentPolicy": "DEGRADED",
      "storeReachable": false
    }
    "#);
}

#[tokio::test]
async fn unreachable_store_fails_closed() {
    let config = indoc! {r#"
        [server.rate_limits]
        enabled = true
        failure_mode = "closed"
        store_timeout = "200ms"

        [server.rate_limits.storage]
        type = "redis"
        url = "redis://127.0.0.1:1/0"
        connection_timeout = "100ms"

        [[server.rate_limits.routes]]
        path = "/api/auth/login"
        limit = 5
        interval = "60s"
    "#};

    let server = TestServer::start(config).await;

    let response = server.client.post("/api/auth/login").await;
    let headers = rate_limit_headers(&response);

    insta::assert_json_snapshot!(headers, @r#"
    {
      "limit": "5",
      "remaining": "0",
      "retry_after": "60",
      "status": 429
    }
    "#);

    // Unlimited routes are still served
    assert_eq!(server.client.get("/docs").await.status(), 200);
}
