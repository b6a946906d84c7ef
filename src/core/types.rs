//! # Core Types Module
//!
//! Value objects that flow through the dispatch pipeline. A [`ProxyRequest`] is built
//! once per inbound call by the HTTP layer, handed to the gateway service, and dropped
//! when the call completes; a [`ProxyResponse`] is either the downstream answer or a
//! response synthesized by the stage that stopped the pipeline.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - `Bytes` is a reference-counted buffer, so cloning a request body never copies it
//! - `HeaderMap` keeps multi-valued headers and compares names case-insensitively
//! - `ServiceInstance` is plain owned data: the registry owns the truth, we only read copies

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::protocols::http::is_hop_by_hop;

/// Rate-limit key used when nothing identifies the caller.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Represents one inbound call in a protocol-neutral shape
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Request identifier (`X-Request-ID`), used for log correlation
    pub id: String,

    pub method: Method,

    /// Path without the query string
    pub path: String,

    /// Raw query string, forwarded as-is
    pub query: Option<String>,

    pub headers: HeaderMap,

    pub body: Bytes,

    /// Address of the immediate caller, appended to `X-Forwarded-For`
    pub caller: Option<IpAddr>,

    /// User id established by the authentication stage
    pub user_id: Option<String>,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            caller: None,
            user_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_caller(mut self, caller: Option<IpAddr>) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id.filter(|id| !id.is_empty());
        self
    }

    /// Key the rate limiter counts this call against.
    ///
    /// Authenticated callers are keyed by user id so that a user keeps one budget
    /// across addresses; everyone else is keyed by caller address.
    pub fn client_key(&self) -> String {
        match (&self.user_id, self.caller) {
            (Some(user_id), _) => format!("uid_{}", user_id),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => ANONYMOUS_CLIENT.to_string(),
        }
    }
}

/// Response produced by the pipeline
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

/// Writes the response back to the caller.
///
/// Framing headers belong to the downstream leg; hyper derives fresh ones for the
/// body we actually send.
impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            if !is_hop_by_hop(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        response
    }
}

/// One registered instance of a logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Logical service name the instance is registered under
    pub name: String,

    /// Network address, either `host:port` or a base URL
    pub address: String,

    /// Relative weight for weighted selection
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Base URL for this instance; bare `host:port` addresses are assumed to speak HTTP.
    pub fn base_url(&self) -> String {
        normalize_address(&self.address)
    }
}

/// Turn a registry address into a base URL without a trailing slash.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
    use axum::http::HeaderValue;

    #[test]
    fn test_client_key_prefers_user_id() {
        let request = ProxyRequest::new(Method::GET, "/api/user/info/1")
            .with_caller(Some("5.6.7.8".parse().unwrap()))
            .with_user_id(Some("42".to_string()));
        assert_eq!(request.client_key(), "uid_42");
    }

    #[test]
    fn test_client_key_falls_back_to_caller_then_anonymous() {
        let request =
            ProxyRequest::new(Method::GET, "/api/x").with_caller(Some("5.6.7.8".parse().unwrap()));
        assert_eq!(request.client_key(), "5.6.7.8");

        let request = ProxyRequest::new(Method::GET, "/api/x").with_user_id(Some(String::new()));
        assert_eq!(request.client_key(), ANONYMOUS_CLIENT);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("localhost:8000"), "http://localhost:8000");
        assert_eq!(normalize_address("http://10.0.0.2:9000/"), "http://10.0.0.2:9000");
        assert_eq!(normalize_address("https://users.internal"), "https://users.internal");
    }

    #[test]
    fn test_response_drops_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let response = ProxyResponse::new(StatusCode::CREATED, headers, "hello").into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(response.headers().get(TRANSFER_ENCODING).is_none());
        assert!(response.headers().get(CONNECTION).is_none());
        assert_ne!(
            response.headers().get(CONTENT_LENGTH).map(|v| v.as_bytes()),
            Some(&b"999"[..])
        );
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    }
}
