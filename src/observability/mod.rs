//! # Observability
//!
//! Structured logging through `tracing` and Prometheus metrics through the `metrics`
//! facade. Both are process-wide and installed once from `main`; library code only
//! emits events and records metrics, so tests run without either being installed.

// Structured logging
pub mod logging;

// Metric names and recording helpers
pub mod metrics;

pub use logging::init_logging;
pub use metrics::install_prometheus;
