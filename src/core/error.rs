//! # Error Handling
//!
//! Every failure the gateway can observe is a variant of [`GatewayError`]. The dispatch
//! pipeline never lets an expected failure escape as a fault: each stage converts its
//! error into a response value through [`GatewayError::into_proxy_response`], and the
//! HTTP layer uses the `IntoResponse` impl for errors raised outside the pipeline
//! (authentication, admin endpoints).
//!
//! ## Status mapping
//!
//! | Condition                              | Status |
//! |----------------------------------------|--------|
//! | No matching route                      | 404    |
//! | Rate limit exceeded                    | 429    |
//! | Circuit open for target                | 503    |
//! | Target resolved but unhealthy          | 503    |
//! | Target misconfigured                   | 500    |
//! | Downstream transport failure           | 502    |
//! | Downstream response unreadable         | 500    |
//!
//! ## Rust Concepts Used
//!
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error(...)]` attributes
//! - `From` impls let `?` convert library errors into `GatewayError` automatically
//! - The `IntoResponse` trait teaches axum how to render our error type

use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;

use crate::core::types::ProxyResponse;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No configured route prefix matches the request path
    #[error("No route for path: {path}")]
    RouteNotFound { path: String },

    /// The caller exceeded its admission budget for the current window
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    RateLimitExceeded { limit: u32, window: String },

    /// Circuit breaker is open, preventing requests to a failing target
    #[error("Circuit breaker open for target: {target}")]
    CircuitBreakerOpen { target: String },

    /// Target could not be reached or failed its liveness probe
    #[error("Service unavailable: {target} - {reason}")]
    ServiceUnavailable { target: String, reason: String },

    /// Target reference cannot be turned into an address (misconfiguration)
    #[error("Target unresolved: {target} - {reason}")]
    TargetUnresolved { target: String, reason: String },

    /// Transport-level failure talking to the downstream service
    #[error("Bad gateway: {target} - {reason}")]
    BadGateway { target: String, reason: String },

    /// Downstream answered but its body could not be read
    #[error("Failed to read downstream response from {target}: {reason}")]
    UpstreamBody { target: String, reason: String },

    /// Authentication failures (missing or invalid tokens)
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Request validation errors (bad admin query parameters, etc.)
    #[error("Request validation failed: {field} - {reason}")]
    RequestValidation { field: String, reason: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors outside the forward step (registry queries, client setup)
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    /// JWT token validation errors
    #[error("JWT error: {message}")]
    Jwt { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn route_not_found<S: Into<String>>(path: S) -> Self {
        Self::RouteNotFound { path: path.into() }
    }

    pub fn circuit_open<S: Into<String>>(target: S) -> Self {
        Self::CircuitBreakerOpen {
            target: target.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>, R: Into<String>>(target: S, reason: R) -> Self {
        Self::ServiceUnavailable {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn unresolved<S: Into<String>, R: Into<String>>(target: S, reason: R) -> Self {
        Self::TargetUnresolved {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_gateway<S: Into<String>, R: Into<String>>(target: S, reason: R) -> Self {
        Self::BadGateway {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn validation<F: Into<String>, S: Into<String>>(field: F, reason: S) -> Self {
        Self::RequestValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code returned to callers for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::TargetUnresolved { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamBody { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Jwt { .. } => StatusCode::UNAUTHORIZED,
            Self::RequestValidation { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether this failure is charged to the target's circuit breaker.
    ///
    /// Only failures that say something about the target's health count: an
    /// unhealthy or unreachable target, and a transport failure while forwarding.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. } | Self::BadGateway { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::TargetUnresolved { .. } => "target_unresolved",
            Self::BadGateway { .. } => "bad_gateway",
            Self::UpstreamBody { .. } => "upstream_body_error",
            Self::Authentication { .. } => "authentication_error",
            Self::RequestValidation { .. } => "request_validation_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
            Self::Jwt { .. } => "jwt_error",
        }
    }

    fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "code": self.status_code().as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        })
    }

    /// Render this error as a terminal pipeline response.
    pub fn into_proxy_response(self) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ProxyResponse {
            status: self.status_code(),
            headers,
            body: Bytes::from(self.body().to_string()),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Jwt {
            message: err.to_string(),
        }
    }
}

/// Lets axum handlers return `GatewayResult<T>` directly.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.body())).into_response()
    }
}
