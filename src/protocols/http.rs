//! # HTTP Forwarding
//!
//! Sends an admitted request to its resolved downstream address and turns the
//! answer back into a [`ProxyResponse`].
//!
//! - the downstream URL is `<address><forward path>[?<query>]`
//! - the body is sent byte-for-byte
//! - hop-by-hop headers are dropped in both directions, `Host` is set for the new target
//! - the caller's address is appended to `X-Forwarded-For`
//! - each attempt is bounded by the route timeout
//!
//! The outcome of every attempt is reported to the circuit breaker under the route's
//! target string. A transport failure (refused connection, reset, timeout) is a
//! breaker failure and a 502; a downstream answer of any status is a breaker success.
//!
//! ## Rust Concepts Used
//!
//! - `reqwest::Client` is an `Arc` internally, so one client (and its connection
//!   pool) is shared by every request
//! - `Bytes` bodies are cloned by bumping a reference count

use axum::http::header::{HeaderValue, HOST};
use axum::http::HeaderMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{normalize_address, ProxyRequest, ProxyResponse};
use crate::observability::metrics;
use crate::routing::Route;

/// Connection-scoped headers that never cross the proxy
pub const HOP_BY_HOP_HEADERS: [&str; 11] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "expect",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Case-insensitive membership test against [`HOP_BY_HOP_HEADERS`]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Build the downstream header set from the inbound headers.
///
/// Multi-valued headers keep every value. When the caller is known it is appended
/// to any existing `X-Forwarded-For` chain as `"<existing>, <caller>"`.
pub fn forward_headers(inbound: &HeaderMap, caller: Option<IpAddr>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name.as_str()) || *name == HOST || name.as_str() == X_FORWARDED_FOR {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // Joined as raw bytes so values that are not visible ASCII stay in the chain
    let mut chain: Vec<u8> = Vec::new();
    for value in inbound.get_all(X_FORWARDED_FOR).iter() {
        let value = trim_ows(value.as_bytes());
        if value.is_empty() {
            continue;
        }
        if !chain.is_empty() {
            chain.extend_from_slice(b", ");
        }
        chain.extend_from_slice(value);
    }
    if let Some(ip) = caller {
        if !chain.is_empty() {
            chain.extend_from_slice(b", ");
        }
        chain.extend_from_slice(ip.to_string().as_bytes());
    }

    if !chain.is_empty() {
        match HeaderValue::from_bytes(&chain) {
            Ok(value) => {
                headers.insert(X_FORWARDED_FOR, value);
            }
            Err(e) => warn!(error = %e, "Dropping unrepresentable X-Forwarded-For chain"),
        }
    }
    headers
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Forwards requests downstream and reports outcomes to the circuit breaker
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl ProxyForwarder {
    pub fn new(client: reqwest::Client, breaker: Arc<CircuitBreaker>) -> Self {
        Self { client, breaker }
    }

    /// Downstream URL for `request` on `route` at `address`
    pub fn downstream_url(route: &Route, address: &str, request: &ProxyRequest) -> String {
        let mut url = normalize_address(address);
        url.push_str(&route.forward_path(&request.path));
        if let Some(query) = request.query.as_deref() {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Make one attempt against `address`.
    ///
    /// Downstream 4xx and 5xx answers are returned as-is and count as successes for
    /// the breaker; only the absence of an answer is a failure.
    pub async fn forward(
        &self,
        route: &Route,
        address: &str,
        request: &ProxyRequest,
    ) -> GatewayResult<ProxyResponse> {
        let result = self.attempt(route, address, request).await;
        match &result {
            Ok(_) => self.breaker.record_success(&route.target),
            Err(e) => {
                self.breaker.record_error(&route.target, e);
            }
        }
        result
    }

    async fn attempt(
        &self,
        route: &Route,
        address: &str,
        request: &ProxyRequest,
    ) -> GatewayResult<ProxyResponse> {
        let url = Self::downstream_url(route, address, request);

        let response = match self
            .client
            .request(request.method.clone(), &url)
            .headers(forward_headers(&request.headers, request.caller))
            .body(request.body.clone())
            .timeout(route.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::record_upstream_failure(&route.target, "transport");
                let reason = if e.is_timeout() {
                    format!("timed out after {:?}", route.timeout)
                } else {
                    e.to_string()
                };
                warn!(
                    request_id = %request.id,
                    target_key = %route.target,
                    url = %url,
                    error = %reason,
                    "Downstream request failed"
                );
                return Err(GatewayError::bad_gateway(&route.target, reason));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            metrics::record_upstream_failure(&route.target, "body");
            warn!(
                request_id = %request.id,
                target_key = %route.target,
                url = %url,
                error = %e,
                "Failed to read downstream response"
            );
            GatewayError::UpstreamBody {
                target: route.target.clone(),
                reason: e.to_string(),
            }
        })?;

        debug!(
            request_id = %request.id,
            target_key = %route.target,
            status = status.as_u16(),
            bytes = body.len(),
            "Downstream responded"
        );

        Ok(ProxyResponse::new(status, headers, body))
    }
}
