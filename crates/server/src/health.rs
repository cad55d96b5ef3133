use std::{net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use axum::{Json, Router, extract::State, routing::get};
use config::HealthConfig;
use rate_limit::{HealthReport, PolicyState, RateLimitManager};

/// Shared state of the health endpoint.
#[derive(Clone, Default)]
pub(crate) struct HealthState {
    manager: Option<Arc<RateLimitManager>>,
}

impl HealthState {
    pub fn new(manager: Option<Arc<RateLimitManager>>) -> Self {
        Self { manager }
    }
}

/// Reports whether the rate limit store answers and which policy is in effect.
///
/// Always `200 OK`: a degraded limiter still serves traffic.
pub(crate) async fn health(State(state): State<HealthState>) -> Json<HealthReport> {
    let report = match &state.manager {
        Some(manager) => manager.health().await,
        None => HealthReport {
            store_reachable: true,
            current_policy: PolicyState::Normal,
        },
    };

    Json(report)
}

pub(crate) fn router(config: &HealthConfig, state: HealthState) -> Router {
    Router::new().route(&config.path, get(health)).with_state(state)
}

/// Binds the health check endpoint to its own address.
pub(super) async fn bind_health_endpoint(
    addr: SocketAddr,
    health_config: HealthConfig,
    state: HealthState,
) -> anyhow::Result<()> {
    let path = &health_config.path;
    let app = router(&health_config, state).into_make_service();

    log::info!("Health check endpoint exposed at http://{addr}{path}");

    axum_server::bind(addr)
        .serve(app)
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server in the health endpoint: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn disabled_rate_limiting_is_always_healthy() {
        let app = router(&HealthConfig::default(), HealthState::default());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        insta::assert_snapshot!(String::from_utf8_lossy(&body), @r#"{"storeReachable":true,"currentPolicy":"NORMAL"}"#);
    }
}
