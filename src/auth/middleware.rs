//! # Authentication Middleware
//!
//! Axum `from_fn_with_state` middleware around the proxy routes.
//!
//! - `OPTIONS` requests and configured skip paths pass through untouched
//! - any client-supplied `X-User-ID` is removed before verification
//! - a verified token sets `X-User-ID` and inserts an [`AuthContext`] extension
//! - a missing or invalid token is answered with 401 and never reaches the pipeline

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::warn;

use super::jwt::{AuthContext, Authenticator};
use crate::core::error::GatewayError;
use crate::middleware::RequestId;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state of the authentication middleware
#[derive(Clone)]
pub struct AuthGuard {
    authenticator: Arc<dyn Authenticator>,
    skip_paths: Arc<[String]>,
}

impl AuthGuard {
    pub fn new(authenticator: Arc<dyn Authenticator>, skip_paths: Vec<String>) -> Self {
        Self {
            authenticator,
            skip_paths: skip_paths.into(),
        }
    }

    pub fn is_skipped(&self, method: &Method, path: &str) -> bool {
        *method == Method::OPTIONS || self.skip_paths.iter().any(|p| p == path)
    }
}

/// Axum middleware function for authentication
pub async fn auth_middleware(
    State(guard): State<AuthGuard>,
    mut request: Request,
    next: Next,
) -> Response {
    request.headers_mut().remove(USER_ID_HEADER);

    if guard.is_skipped(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let credential = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let context: AuthContext = match guard.authenticator.authenticate(&credential).await {
        Ok(context) => context,
        Err(err) => {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .map(|id| id.0.clone())
                .unwrap_or_default();
            warn!(
                request_id = %request_id,
                path = %request.uri().path(),
                error = %err,
                "Authentication failed"
            );
            let reason = match err {
                GatewayError::Authentication { reason } => reason,
                other => other.to_string(),
            };
            return GatewayError::auth(reason).into_response();
        }
    };

    match HeaderValue::from_str(&context.user_id) {
        Ok(value) => {
            request.headers_mut().insert(USER_ID_HEADER, value);
        }
        Err(_) => return GatewayError::auth("invalid user id claim").into_response(),
    }
    request.extensions_mut().insert(context);

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::tests::{token, SECRET};
    use crate::auth::jwt::JwtAuthenticator;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    async fn echo_user(request: Request) -> String {
        let header = request
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let ext = request
            .extensions()
            .get::<AuthContext>()
            .map(|c| c.user_id.clone())
            .unwrap_or_else(|| "-".to_string());
        format!("{}|{}", header, ext)
    }

    fn app() -> Router {
        let guard = AuthGuard::new(
            Arc::new(JwtAuthenticator::new(SECRET)),
            vec!["/api/user/login".to_string()],
        );
        Router::new()
            .route("/api/*path", get(echo_user).post(echo_user))
            .layer(axum::middleware::from_fn_with_state(guard, auth_middleware))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_sets_identity() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/user/info/1")
                    .header("authorization", format!("Bearer {}", token(SECRET, 42, 600)))
                    .header(USER_ID_HEADER, "999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "42|42");
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/user/info/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn test_skip_path_strips_spoofed_user_id() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/user/login")
                    .header(USER_ID_HEADER, "999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "-|-");
    }

    #[test]
    fn test_options_is_skipped() {
        let guard = AuthGuard::new(Arc::new(JwtAuthenticator::new(SECRET)), Vec::new());
        assert!(guard.is_skipped(&Method::OPTIONS, "/api/user/info/1"));
        assert!(!guard.is_skipped(&Method::GET, "/api/user/info/1"));
    }
}
