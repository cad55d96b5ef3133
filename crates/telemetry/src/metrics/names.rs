//! Metric names. HTTP names follow the OpenTelemetry semantic conventions,
//! see https://opentelemetry.io/docs/specs/semconv/http/http-metrics/

/// HTTP server request duration in milliseconds
/// Note: Histograms automatically provide count and sum, so a separate counter is not needed
pub const HTTP_SERVER_REQUEST_DURATION: &str = "http.server.request.duration";

/// Rate limit decisions, labeled with `route`, `strategy` and `outcome`.
pub const RATE_LIMIT_DECISIONS: &str = "rate_limit.decisions";

/// Duration of a bucket store update in milliseconds, labeled with `backend` and `status`.
pub const RATE_LIMIT_STORE_DURATION: &str = "rate_limit.store.duration";
