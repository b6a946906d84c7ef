//! # Blog Gateway Library
//!
//! Single entry point in front of the blog's backend services. Every proxied call
//! passes through a fixed pipeline:
//!
//! ```text
//! RateLimiter -> RouteTable -> CircuitBreaker -> ServiceResolver -> ProxyForwarder
//! ```
//!
//! Each stage can end the request with its own response; see [`core::error`] for the
//! status mapping.
//!
//! ## Module Layout
//!
//! - `core`: errors, configuration, shared value types and the circuit breaker
//! - `routing`: ordered first-match route table
//! - `discovery`: service registries and the target resolver
//! - `load_balancing`: instance selection strategies
//! - `middleware`: rate limiting, request ids, CORS
//! - `protocols`: HTTP forwarding
//! - `auth`: optional JWT stage
//! - `gateway`: pipeline orchestration and the HTTP servers
//! - `admin`: operational endpoints on the admin port
//! - `observability`: logging and Prometheus metrics

/// Error types, configuration, value objects and the circuit breaker
pub mod core;

/// Pipeline orchestration and the public/admin servers
pub mod gateway;

/// Rate limiting, request id propagation and CORS
pub mod middleware;

/// Downstream HTTP forwarding
pub mod protocols;

/// JWT authentication in front of the proxied routes
pub mod auth;

/// Instance selection for `service://` targets
pub mod load_balancing;

/// Registries and target resolution
pub mod discovery;

/// Prefix route table
pub mod routing;

/// Logging and metrics
pub mod observability;

/// Operational endpoints
pub mod admin;

pub use core::config::{ConfigManager, GatewayConfig};
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{ProxyRequest, ProxyResponse, ServiceInstance};
pub use gateway::{GatewayServer, GatewayService};
