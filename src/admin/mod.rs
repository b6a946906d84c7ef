//! # Admin API
//!
//! Operational endpoints served on the separate admin port: liveness, Prometheus
//! metrics, route listing, circuit breaker inspection and reset, rate-limit window
//! reset, and on-demand target probing.
//!
//! ## Security Note
//! These endpoints can clear breaker and rate-limit state. Bind the admin port to an
//! internal interface only.

pub mod endpoints;

pub use endpoints::{AdminRouter, AdminState};
