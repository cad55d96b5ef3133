//! Tollgate configuration structures to map the tollgate.toml configuration.

#![deny(missing_docs)]

mod health;
mod loader;
mod rate_limit;
mod server;
mod telemetry;

use std::path::Path;

pub use health::HealthConfig;
pub use rate_limit::*;
use serde::Deserialize;
pub use server::ServerConfig;
pub use telemetry::{ExportersConfig, OtlpExporterConfig, OtlpProtocol, TelemetryConfig};

/// Main configuration structure for the Tollgate application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Telemetry configuration settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// String values may reference environment variables with `{{ env.NAME }}`.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates the rate limit settings, returning warnings for suspicious but usable values.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        loader::validate_rate_limits(&self.server.rate_limits)
    }
}
