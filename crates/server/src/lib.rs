//! Tollgate server library.
//!
//! Wraps an axum application with the rate limiter, exposes the health endpoint and
//! serves it. Used by the binary and by the integration tests.

#![deny(missing_docs)]

mod health;
mod metrics;
mod rate_limit;
mod reload;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use ::rate_limit::RateLimitManager;
use anyhow::anyhow;
use axum::Router;
use config::Config;
use health::HealthState;
use tokio::net::TcpListener;

pub use self::metrics::{MetricsLayer, MetricsService};
pub use self::rate_limit::{AuthenticatedUser, RateLimitLayer, RateLimitService};

/// Configuration for serving tollgate.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized tollgate TOML configuration.
    pub config: Config,
    /// The file the configuration was loaded from. Route rules are reloaded from it on
    /// SIGHUP; without it, reloading is disabled.
    pub config_path: Option<PathBuf>,
    /// The application to protect.
    pub app: Router,
}

/// Starts and runs the tollgate server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        config_path,
        app,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let rate_limits = &config.server.rate_limits;

    let manager = if rate_limits.enabled {
        log::debug!("Initializing rate limit manager with {} routes", rate_limits.routes.len());
        Some(Arc::new(RateLimitManager::new(rate_limits).await?))
    } else {
        log::debug!("Rate limiting disabled - no manager created");
        None
    };

    let mut app = app;

    if let Some(manager) = &manager {
        app = app.layer(RateLimitLayer::new(manager.clone()));

        match config_path {
            Some(path) => reload::spawn_on_sighup(path, manager.clone())?,
            None => log::debug!("No configuration file, rate limit routes will not be reloaded"),
        }
    }

    // The health endpoint is added after the rate limiter so it is never limited.
    if config.server.health.enabled {
        let state = HealthState::new(manager.clone());

        match config.server.health.listen {
            Some(listen) => {
                let health_config = config.server.health.clone();

                tokio::spawn(async move {
                    if let Err(e) = health::bind_health_endpoint(listen, health_config, state).await {
                        log::error!("{e}");
                    }
                });
            }
            None => app = app.merge(health::router(&config.server.health, state)),
        }
    }

    let app = app.layer(MetricsLayer);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    log::info!("Tollgate listening at http://{listen_address}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;

    Ok(())
}
