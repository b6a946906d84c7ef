//! `X-Request-ID` propagation.
//!
//! The inbound id is kept when present, otherwise a UUID v4 is generated. Either
//! way the id is written onto the request (so it travels downstream), stored as a
//! [`RequestId`] extension for handlers, and echoed on the response.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id of the current call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let inbound = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .filter(|v| !v.is_empty())
        .cloned();

    let value = match inbound {
        Some(value) => value,
        None => {
            let generated = uuid::Uuid::new_v4().to_string();
            // A hyphenated UUID is always a valid header value
            HeaderValue::from_str(&generated).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
        }
    };

    let id = String::from_utf8_lossy(value.as_bytes()).into_owned();
    request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    request.extensions_mut().insert(RequestId(id));

    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}
