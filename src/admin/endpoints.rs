//! # Admin Endpoints
//!
//! | Method | Path                              | Purpose                                  |
//! |--------|-----------------------------------|------------------------------------------|
//! | GET    | `/health`                         | admin liveness with component summary    |
//! | GET    | `/metrics`                        | Prometheus text exposition               |
//! | GET    | `/admin/routes`                   | route table in match order               |
//! | GET    | `/admin/circuit-breakers`         | breaker settings and per-target state    |
//! | POST   | `/admin/circuit-breakers/reset`   | `?target=` clear a target's failures     |
//! | DELETE | `/admin/rate-limits`              | `?client=` clear a client's window       |
//! | GET    | `/admin/targets/health`           | `?target=` resolve, probe, time a target |

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::circuit_breaker::CircuitBreakerSnapshot;
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::GatewayService;
use crate::routing::Route;

/// Admin router state
#[derive(Clone)]
pub struct AdminState {
    pub service: GatewayService,
    pub metrics: Option<PrometheusHandle>,
}

impl AdminState {
    pub fn new(service: GatewayService) -> Self {
        Self {
            service,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Admin router for operational endpoints
pub struct AdminRouter;

impl AdminRouter {
    pub fn create_router(state: AdminState) -> Router {
        Router::new()
            .route("/health", get(admin_health))
            .route("/metrics", get(render_metrics))
            .route("/admin/routes", get(list_routes))
            .route("/admin/circuit-breakers", get(list_circuit_breakers))
            .route("/admin/circuit-breakers/reset", post(reset_circuit_breaker))
            .route("/admin/rate-limits", delete(reset_rate_limit))
            .route("/admin/targets/health", get(probe_target))
            .with_state(state)
    }
}

#[derive(Debug, Serialize)]
struct AdminHealth {
    status: &'static str,
    service: &'static str,
    routes: usize,
    tracked_targets: usize,
    rate_limit_store: &'static str,
    selection: &'static str,
}

async fn admin_health(State(state): State<AdminState>) -> Json<AdminHealth> {
    let service = &state.service;
    Json(AdminHealth {
        status: "ok",
        service: "gateway-admin",
        routes: service.routes().len(),
        tracked_targets: service.breaker().tracked_targets(),
        rate_limit_store: service.rate_limiter().store_kind(),
        selection: service.resolver().strategy_name(),
    })
}

async fn render_metrics(State(state): State<AdminState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

async fn list_routes(State(state): State<AdminState>) -> Json<Vec<Route>> {
    Json(state.service.routes().routes())
}

#[derive(Debug, Serialize)]
struct CircuitBreakerOverview {
    enabled: bool,
    half_open: bool,
    failure_threshold: u32,
    recovery_timeout_ms: u64,
    targets: Vec<CircuitBreakerSnapshot>,
}

async fn list_circuit_breakers(State(state): State<AdminState>) -> Json<CircuitBreakerOverview> {
    let breaker = state.service.breaker();
    let config = breaker.config();
    Json(CircuitBreakerOverview {
        enabled: config.enabled,
        half_open: config.half_open,
        failure_threshold: config.failure_threshold,
        recovery_timeout_ms: config.recovery_timeout.as_millis() as u64,
        targets: breaker.snapshot_all(),
    })
}

#[derive(Debug, Deserialize)]
struct TargetQuery {
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientQuery {
    client: Option<String>,
}

fn required(value: Option<String>, field: &str) -> GatewayResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::validation(field, "query parameter is required"))
}

#[derive(Debug, Serialize)]
struct ResetOutcome {
    target: String,
    reset: bool,
}

async fn reset_circuit_breaker(
    State(state): State<AdminState>,
    Query(query): Query<TargetQuery>,
) -> GatewayResult<Json<ResetOutcome>> {
    let target = required(query.target, "target")?;
    let breaker = state.service.breaker();
    let tracked = breaker.snapshot(&target).is_some();
    breaker.try_reset(&target);
    info!(target_key = %target, tracked, "Circuit breaker reset via admin API");
    Ok(Json(ResetOutcome {
        target,
        reset: tracked,
    }))
}

async fn reset_rate_limit(
    State(state): State<AdminState>,
    Query(query): Query<ClientQuery>,
) -> GatewayResult<StatusCode> {
    let client = required(query.client, "client")?;
    state
        .service
        .rate_limiter()
        .reset(&client)
        .await
        .map_err(|e| GatewayError::service_unavailable("rate-limit store", e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct TargetProbe {
    target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Resolve and probe without touching breaker state
async fn probe_target(
    State(state): State<AdminState>,
    Query(query): Query<TargetQuery>,
) -> GatewayResult<Json<TargetProbe>> {
    let target = required(query.target, "target")?;
    let resolver = state.service.resolver();

    let address = match resolver.resolve(&target).await {
        Ok(address) => address,
        Err(e) => {
            return Ok(Json(TargetProbe {
                target,
                address: None,
                healthy: false,
                latency_ms: None,
                error: Some(e.to_string()),
            }))
        }
    };

    let (healthy, latency) = tokio::join!(resolver.health(&address), resolver.latency(&address));
    Ok(Json(TargetProbe {
        target,
        address: Some(address),
        healthy,
        latency_ms: Some(latency.as_millis() as u64),
        error: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreaker;
    use crate::core::config::{CircuitBreakerConfig, RateLimitConfig, RateLimitStoreKind};
    use crate::core::types::ServiceInstance;
    use crate::discovery::{ServiceResolver, StaticRegistry};
    use crate::load_balancing::FirstInstance;
    use crate::middleware::{InMemoryWindowStore, RateLimiter};
    use crate::protocols::ProxyForwarder;
    use crate::routing::RouteTable;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(registry: Arc<StaticRegistry>) -> GatewayService {
        let client = reqwest::Client::new();
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        GatewayService::new(
            Arc::new(RateLimiter::new(
                RateLimitConfig {
                    requests_per_second: 1,
                    burst: 0,
                    store: RateLimitStoreKind::Memory,
                    ..RateLimitConfig::default()
                },
                Arc::new(InMemoryWindowStore::new()),
            )),
            Arc::new(RouteTable::new(vec![Route::new(
                "/api/user",
                "service://user-service",
                Duration::from_secs(5),
            )])),
            Arc::clone(&breaker),
            Arc::new(ServiceResolver::new(
                registry,
                Arc::new(FirstInstance),
                client.clone(),
                Duration::from_secs(1),
            )),
            ProxyForwarder::new(client, breaker),
        )
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_routes_and_health() {
        let app = AdminRouter::create_router(AdminState::new(service(Arc::new(StaticRegistry::new()))));

        let (status, body) = call(app.clone(), "GET", "/admin/routes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["prefix"], "/api/user");
        assert_eq!(body[0]["timeout"], "5s");

        let (status, body) = call(app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["routes"], 1);
        assert_eq!(body["rate_limit_store"], "memory");
    }

    #[tokio::test]
    async fn test_circuit_breaker_listing_and_reset() {
        let service = service(Arc::new(StaticRegistry::new()));
        for _ in 0..5 {
            service.breaker().record_failure("service://user-service");
        }
        let app = AdminRouter::create_router(AdminState::new(service.clone()));

        let (_, body) = call(app.clone(), "GET", "/admin/circuit-breakers").await;
        assert_eq!(body["targets"][0]["state"], "open");
        assert_eq!(body["targets"][0]["failure_count"], 5);

        let (status, body) = call(
            app.clone(),
            "POST",
            "/admin/circuit-breakers/reset?target=service://user-service",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reset"], true);
        assert!(!service.breaker().is_open("service://user-service"));

        let (status, body) = call(app, "POST", "/admin/circuit-breakers/reset").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "request_validation_error");
    }

    #[tokio::test]
    async fn test_rate_limit_reset() {
        let service = service(Arc::new(StaticRegistry::new()));
        let limiter = service.rate_limiter().clone();
        assert!(limiter.allow("uid_7").await);
        assert!(!limiter.allow("uid_7").await);

        let app = AdminRouter::create_router(AdminState::new(service));
        let (status, _) = call(app, "DELETE", "/admin/rate-limits?client=uid_7").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(limiter.allow("uid_7").await);
    }

    #[tokio::test]
    async fn test_target_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = Arc::new(StaticRegistry::from_instances([ServiceInstance::new(
            "user-service",
            server.uri(),
        )]));
        let app = AdminRouter::create_router(AdminState::new(service(registry)));

        let (status, body) = call(
            app.clone(),
            "GET",
            "/admin/targets/health?target=service://user-service",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["address"], server.uri());

        let (_, body) = call(app, "GET", "/admin/targets/health?target=service://missing").await;
        assert_eq!(body["healthy"], false);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_metrics_without_exporter() {
        let app = AdminRouter::create_router(AdminState::new(service(Arc::new(StaticRegistry::new()))));
        let (status, _) = call(app, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
