//! Tests against a real Redis. They are skipped unless `REDIS_URL` is set.

use indoc::formatdoc;
use integration_tests::TestServer;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok()
}

fn config(url: &str, prefix: &str) -> String {
    formatdoc! {r#"
        [server.rate_limits]
        enabled = true

        [server.rate_limits.storage]
        type = "redis"
        url = "{url}"
        key_prefix = "{prefix}"

        [[server.rate_limits.routes]]
        path = "/api/auth/login"
        limit = 3
        interval = "60s"
    "#}
}

fn unique_prefix(test: &str) -> String {
    format!("tollgate_test_{test}_{}:", jiff::Timestamp::now().as_millisecond())
}

#[tokio::test]
async fn redis_store_enforces_limit() {
    let Some(url) = redis_url() else {
        return;
    };

    let server = TestServer::start(&config(&url, &unique_prefix("limit"))).await;

    let mut statuses = Vec::new();

    for _ in 0..4 {
        statuses.push(server.client.post("/api/auth/login").await.status().as_u16());
    }

    assert_eq!(statuses, [200, 200, 200, 429]);

    let health: serde_json::Value = server.client.get("/health").await.json().await.unwrap();
    assert_eq!(health["storeReachable"], true);
    assert_eq!(health["currentPolicy"], "NORMAL");
}

#[tokio::test]
async fn instances_share_the_limit() {
    let Some(url) = redis_url() else {
        return;
    };

    let config = config(&url, &unique_prefix("shared"));

    let first = TestServer::start(&config).await;
    let second = TestServer::start(&config).await;

    assert_eq!(first.client.post("/api/auth/login").await.status(), 200);
    assert_eq!(second.client.post("/api/auth/login").await.status(), 200);
    assert_eq!(first.client.post("/api/auth/login").await.status(), 200);

    let denied = second.client.post("/api/auth/login").await;
    assert_eq!(denied.status(), 429);
    assert_eq!(denied.headers().get("x-ratelimit-remaining").unwrap(), "0");
}

#[tokio::test]
async fn concurrent_requests_never_overshoot() {
    let Some(url) = redis_url() else {
        return;
    };

    // With fewer contenders than attempts, no update can run out of retries.
    let config = formatdoc! {r#"
        [server.rate_limits]
        enabled = true
        max_retries = 10
        store_timeout = "2s"

        [server.rate_limits.storage]
        type = "redis"
        url = "{url}"
        key_prefix = "{prefix}"

        [[server.rate_limits.routes]]
        path = "/api/auth/login"
        limit = 6
        interval = "1h"
    "#, prefix = unique_prefix("concurrent")};

    let server = TestServer::start(&config).await;
    let url = format!("http://{}/api/auth/login", server.address);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let url = url.clone();
            tokio::spawn(async move { reqwest::Client::new().post(url).send().await.unwrap().status().as_u16() })
        })
        .collect();

    let mut statuses = Vec::new();

    for task in tasks {
        statuses.push(task.await.unwrap());
    }

    let allowed = statuses.iter().filter(|status| **status == 200).count();
    let denied = statuses.iter().filter(|status| **status == 429).count();

    assert_eq!((allowed, denied), (6, 2));
}
