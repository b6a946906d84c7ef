//! # Gateway Metrics
//!
//! Metric names and small recording helpers. Recording goes through the `metrics`
//! facade, which is a no-op until [`install_prometheus`] installs the recorder; the
//! returned handle renders the text exposition served by the admin API.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REQUEST_DURATION: &str = "gateway_request_duration_seconds";
pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
pub const RATE_LIMITER_DEGRADED_TOTAL: &str = "gateway_rate_limiter_degraded_total";
pub const CIRCUIT_OPEN_TOTAL: &str = "gateway_circuit_open_total";
pub const UPSTREAM_FAILURES_TOTAL: &str = "gateway_upstream_failures_total";

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Label value for requests that matched no route
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Install the global Prometheus recorder
pub fn install_prometheus() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
        .map_err(|e| GatewayError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::config(format!("Failed to install metrics recorder: {}", e)))
}

/// One completed call through the pipeline
pub fn record_request(route: &str, status: u16, elapsed: Duration) {
    metrics::counter!(
        REQUESTS_TOTAL,
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION, "route" => route.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_rate_limited() {
    metrics::counter!(RATE_LIMITED_TOTAL).increment(1);
}

/// The window store failed and the request was admitted anyway
pub fn record_rate_limiter_degraded() {
    metrics::counter!(RATE_LIMITER_DEGRADED_TOTAL).increment(1);
}

pub fn record_circuit_open(target: &str) {
    metrics::counter!(CIRCUIT_OPEN_TOTAL, "target" => target.to_string()).increment(1);
}

/// `kind` is one of `unresolved`, `unhealthy`, `transport`, `body`
pub fn record_upstream_failure(target: &str, kind: &'static str) {
    metrics::counter!(
        UPSTREAM_FAILURES_TOTAL,
        "target" => target.to_string(),
        "kind" => kind
    )
    .increment(1);
}
