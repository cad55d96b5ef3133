//! Route table reload on SIGHUP.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use config::Config;
use rate_limit::RateLimitManager;

/// Reloads the rate limit routes from `path` every time the process receives SIGHUP.
#[cfg(unix)]
pub(crate) fn spawn_on_sighup(path: PathBuf, manager: Arc<RateLimitManager>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            log::info!("Received SIGHUP, reloading rate limits from {}", path.display());

            if let Err(e) = reload(&path, &manager) {
                log::error!(
                    "Failed to reload rate limits from {}, keeping the previous routes: {e:#}",
                    path.display()
                );
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn spawn_on_sighup(_: PathBuf, _: Arc<RateLimitManager>) -> anyhow::Result<()> {
    log::debug!("Configuration reload is only available on unix");
    Ok(())
}

/// Loads and validates the configuration file, then swaps in its routes and exempt paths.
pub(crate) fn reload(path: &Path, manager: &RateLimitManager) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let rate_limits = &config.server.rate_limits;

    if !rate_limits.enabled {
        bail!("rate limiting cannot be disabled without a restart");
    }

    manager.reload(rate_limits)?;

    Ok(())
}
